//! Consolidation of a drained batch into the wire payload, and the messages
//! pushed to WebSocket clients.
//!
//! Grouping rules live here, on the consumer side of the batch:
//! - sensor readings are grouped by device, then by sensor, keeping every
//!   data point in arrival order plus the most recent capture time;
//! - device status changes collapse to the last one written per device;
//! - only the latest dashboard snapshot is kept.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::ids::{DeviceId, SensorId, SubscriberId, Topic};
use super::updates::{PendingBatch, StatusSnapshot};

/// One observed value of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// All values seen for one sensor during the debounce window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSeries {
    pub sensor_type: String,
    pub data_points: Vec<DataPoint>,
    pub latest_timestamp: DateTime<Utc>,
}

/// Latest status of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusEntry {
    pub device_status: String,
    pub status_data: Value,
    pub timestamp: DateTime<Utc>,
}

impl DeviceStatusEntry {
    /// Replaces the reported status with a freshly computed one, keeping the
    /// capture time of the update that triggered it.
    pub fn refreshed(&self, snapshot: StatusSnapshot) -> Self {
        Self {
            device_status: snapshot.device_status,
            status_data: snapshot.status_data,
            timestamp: self.timestamp,
        }
    }
}

/// device → sensor → series.
pub type SensorData = BTreeMap<DeviceId, BTreeMap<SensorId, SensorSeries>>;

/// device → latest status.
pub type DeviceStatusData = BTreeMap<DeviceId, DeviceStatusEntry>;

/// The grouped sections of a consolidated payload. Empty sections are `None`
/// and never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidatedUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_data: Option<SensorData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_status: Option<DeviceStatusData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<Value>,
}

impl ConsolidatedUpdates {
    /// Applies the grouping rules to a drained batch.
    pub fn from_batch(batch: &PendingBatch) -> Self {
        let mut sensor_data: SensorData = BTreeMap::new();
        for update in &batch.sensor_updates {
            let point = DataPoint {
                value: update.value,
                timestamp: update.captured_at,
            };
            sensor_data
                .entry(update.device_id.clone())
                .or_default()
                .entry(update.sensor_id.clone())
                .and_modify(|series| {
                    series.sensor_type = update.sensor_type.clone();
                    series.latest_timestamp = series.latest_timestamp.max(update.captured_at);
                    series.data_points.push(point.clone());
                })
                .or_insert_with(|| SensorSeries {
                    sensor_type: update.sensor_type.clone(),
                    data_points: vec![point.clone()],
                    latest_timestamp: update.captured_at,
                });
        }

        let mut device_status: DeviceStatusData = BTreeMap::new();
        for update in &batch.device_status_updates {
            // Last write wins.
            device_status.insert(
                update.device_id.clone(),
                DeviceStatusEntry {
                    device_status: update.status_snapshot.device_status.clone(),
                    status_data: update.status_snapshot.status_data.clone(),
                    timestamp: update.captured_at,
                },
            );
        }

        Self {
            sensor_data: (!sensor_data.is_empty()).then_some(sensor_data),
            device_status: (!device_status.is_empty()).then_some(device_status),
            dashboard: batch
                .dashboard_snapshot
                .as_ref()
                .map(|d| d.aggregate_stats.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sensor_data.is_none() && self.device_status.is_none() && self.dashboard.is_none()
    }
}

/// The single message built for one subscriber per flush.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedPayload {
    #[serde(rename = "timestamp")]
    pub built_at: DateTime<Utc>,
    pub updates: ConsolidatedUpdates,
}

impl ConsolidatedPayload {
    /// Value of the `type` field on the wire.
    pub const KIND: &'static str = "batch_update";

    pub fn new(updates: ConsolidatedUpdates) -> Self {
        Self {
            built_at: Utc::now(),
            updates,
        }
    }

    /// Splits the payload into the messages for the narrower topics, one per
    /// device status, one per sensor and one for the dashboard.
    pub fn sections(&self, subscriber: &SubscriberId) -> Vec<(Topic, ServerMessage)> {
        let mut out = Vec::new();

        if let Some(statuses) = &self.updates.device_status {
            for (device_id, entry) in statuses {
                out.push((
                    Topic::Device(device_id.clone()),
                    ServerMessage::DeviceStatusUpdate {
                        device_id: device_id.clone(),
                        data: entry.clone(),
                        timestamp: self.built_at,
                    },
                ));
            }
        }

        if let Some(sensors) = &self.updates.sensor_data {
            for (device_id, by_sensor) in sensors {
                for (sensor_id, series) in by_sensor {
                    out.push((
                        Topic::Sensor(sensor_id.clone()),
                        ServerMessage::SensorUpdate {
                            device_id: device_id.clone(),
                            sensor_id: sensor_id.clone(),
                            data: series.clone(),
                            timestamp: self.built_at,
                        },
                    ));
                }
            }
        }

        if let Some(dashboard) = &self.updates.dashboard {
            out.push((
                Topic::Dashboard(subscriber.clone()),
                ServerMessage::DashboardUpdate {
                    data: dashboard.clone(),
                    timestamp: self.built_at,
                },
            ));
        }

        out
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Consolidated payload on `user:{id}`.
    BatchUpdate(ConsolidatedPayload),
    /// Status section on `device:{id}`.
    DeviceStatusUpdate {
        device_id: DeviceId,
        data: DeviceStatusEntry,
        timestamp: DateTime<Utc>,
    },
    /// Sensor section on `sensor:{id}`.
    SensorUpdate {
        device_id: DeviceId,
        sensor_id: SensorId,
        data: SensorSeries,
        timestamp: DateTime<Utc>,
    },
    /// Dashboard section on `user:{id}:dashboard`.
    DashboardUpdate {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    /// Acknowledges a subscribe request.
    Subscribed { topics: Vec<Topic> },
    /// Acknowledges an unsubscribe request.
    Unsubscribed { topics: Vec<Topic> },
    /// A client request could not be honoured.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::updates::{
        BatchEntry, BatchUpdate, DashboardUpdate, DeviceStatusUpdate, SensorUpdate,
    };
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sensor(device: &str, sensor: &str, value: f64, secs: i64) -> BatchUpdate {
        BatchUpdate::Sensor(SensorUpdate {
            device_id: device.into(),
            sensor_id: sensor.into(),
            sensor_type: "temperature".to_string(),
            value,
            captured_at: at(secs),
        })
    }

    fn status(device: &str, label: &str, secs: i64) -> BatchUpdate {
        BatchUpdate::DeviceStatus(DeviceStatusUpdate {
            device_id: device.into(),
            status_snapshot: StatusSnapshot {
                device_status: label.to_string(),
                status_data: json!({ "label": label }),
            },
            captured_at: at(secs),
        })
    }

    fn batch(updates: Vec<BatchUpdate>) -> PendingBatch {
        PendingBatch::from_entries(updates.into_iter().map(BatchEntry::now).collect()).unwrap()
    }

    #[test]
    fn test_groups_by_device_then_sensor_in_order() {
        let b = batch(vec![
            sensor("A", "t1", 1.0, 1),
            sensor("B", "t1", 10.0, 2),
            sensor("A", "t2", 5.0, 3),
            sensor("A", "t1", 2.0, 4),
            sensor("B", "t1", 11.0, 5),
            sensor("A", "t1", 3.0, 6),
        ]);
        let grouped = ConsolidatedUpdates::from_batch(&b);
        let sensors = grouped.sensor_data.unwrap();

        assert_eq!(sensors.len(), 2);
        let a_t1 = &sensors[&DeviceId::from("A")][&SensorId::from("t1")];
        let values: Vec<f64> = a_t1.data_points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(a_t1.latest_timestamp, at(6));

        let b_t1 = &sensors[&DeviceId::from("B")][&SensorId::from("t1")];
        let values: Vec<f64> = b_t1.data_points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![10.0, 11.0]);
        assert_eq!(sensors[&DeviceId::from("A")].len(), 2);
    }

    #[test]
    fn test_device_status_last_written_wins() {
        let b = batch(vec![
            status("A", "online", 10),
            status("B", "online", 11),
            status("A", "warning", 5),
        ]);
        let grouped = ConsolidatedUpdates::from_batch(&b);
        let statuses = grouped.device_status.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[&DeviceId::from("A")].device_status, "warning");
        assert_eq!(statuses[&DeviceId::from("A")].timestamp, at(5));
        assert_eq!(statuses[&DeviceId::from("B")].device_status, "online");
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let b = batch(vec![sensor("A", "t1", 1.0, 1)]);
        let payload = ConsolidatedPayload::new(ConsolidatedUpdates::from_batch(&b));
        let json = serde_json::to_value(ServerMessage::BatchUpdate(payload)).unwrap();

        assert_eq!(json["type"], ConsolidatedPayload::KIND);
        assert!(json.get("timestamp").is_some());
        let updates = json["updates"].as_object().unwrap();
        assert!(updates.contains_key("sensor_data"));
        assert!(!updates.contains_key("device_status"));
        assert!(!updates.contains_key("dashboard"));
        assert_eq!(
            json["updates"]["sensor_data"]["A"]["t1"]["sensor_type"],
            "temperature"
        );
    }

    #[test]
    fn test_sections_target_narrow_topics() {
        let b = batch(vec![
            sensor("A", "t1", 1.0, 1),
            sensor("A", "t2", 1.5, 1),
            status("A", "online", 2),
            BatchUpdate::Dashboard(DashboardUpdate {
                aggregate_stats: json!({ "online": 1 }),
                captured_at: at(3),
            }),
        ]);
        let payload = ConsolidatedPayload::new(ConsolidatedUpdates::from_batch(&b));
        let topics: Vec<String> = payload
            .sections(&SubscriberId::from("u1"))
            .into_iter()
            .map(|(t, _)| t.to_string())
            .collect();

        assert_eq!(
            topics,
            vec!["device:A", "sensor:t1", "sensor:t2", "user:u1:dashboard"]
        );
    }
}
