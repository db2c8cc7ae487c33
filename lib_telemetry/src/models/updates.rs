//! Update records buffered between broadcasts and the per-subscriber batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{DeviceId, SensorId};

/// Point-in-time status of one device, as reported or as computed by the
/// status provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Coarse status label (e.g. `online`, `warning`, `offline`).
    pub device_status: String,
    /// Free-form detail attached to the status.
    #[serde(default)]
    pub status_data: Value,
}

/// One sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub device_id: DeviceId,
    pub sensor_id: SensorId,
    pub sensor_type: String,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

/// A change in a device's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusUpdate {
    pub device_id: DeviceId,
    pub status_snapshot: StatusSnapshot,
    pub captured_at: DateTime<Utc>,
}

/// A fresh dashboard aggregate for the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardUpdate {
    pub aggregate_stats: Value,
    pub captured_at: DateTime<Utc>,
}

/// A single pending update, tagged with the batch section it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchUpdate {
    Sensor(SensorUpdate),
    DeviceStatus(DeviceStatusUpdate),
    Dashboard(DashboardUpdate),
}

impl BatchUpdate {
    /// Device the update concerns, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            BatchUpdate::Sensor(u) => Some(&u.device_id),
            BatchUpdate::DeviceStatus(u) => Some(&u.device_id),
            BatchUpdate::Dashboard(_) => None,
        }
    }
}

/// Storage envelope for an update while it waits in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub enqueued_at: DateTime<Utc>,
    pub update: BatchUpdate,
}

impl BatchEntry {
    pub fn now(update: BatchUpdate) -> Self {
        Self {
            enqueued_at: Utc::now(),
            update,
        }
    }
}

/// Updates accumulated for one subscriber since the last flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    /// Every sensor reading, in arrival order.
    pub sensor_updates: Vec<SensorUpdate>,
    /// Every status change, in arrival order. Collapsed by the consumer.
    pub device_status_updates: Vec<DeviceStatusUpdate>,
    /// Only the latest dashboard snapshot survives.
    pub dashboard_snapshot: Option<DashboardUpdate>,
    /// When the first update of this batch was recorded.
    pub created_at: DateTime<Utc>,
}

impl PendingBatch {
    /// Rebuilds a batch from stored entries, in storage order.
    ///
    /// Returns `None` for an empty slice: an absent batch and an empty one are
    /// the same thing.
    pub fn from_entries(entries: Vec<BatchEntry>) -> Option<Self> {
        let created_at = entries.iter().map(|e| e.enqueued_at).min()?;
        let mut batch = PendingBatch {
            sensor_updates: Vec::new(),
            device_status_updates: Vec::new(),
            dashboard_snapshot: None,
            created_at,
        };
        for entry in entries {
            batch.push(entry.update);
        }
        Some(batch)
    }

    fn push(&mut self, update: BatchUpdate) {
        match update {
            BatchUpdate::Sensor(u) => self.sensor_updates.push(u),
            BatchUpdate::DeviceStatus(u) => self.device_status_updates.push(u),
            BatchUpdate::Dashboard(u) => self.dashboard_snapshot = Some(u),
        }
    }

    /// Total number of buffered updates (the dashboard counts once at most).
    pub fn len(&self) -> usize {
        self.sensor_updates.len()
            + self.device_status_updates.len()
            + usize::from(self.dashboard_snapshot.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn dashboard(n: i64) -> BatchUpdate {
        BatchUpdate::Dashboard(DashboardUpdate {
            aggregate_stats: json!({ "devices": n }),
            captured_at: Utc.timestamp_opt(n, 0).unwrap(),
        })
    }

    #[test]
    fn test_from_entries_empty_is_none() {
        assert!(PendingBatch::from_entries(Vec::new()).is_none());
    }

    #[test]
    fn test_dashboard_overwrite_on_write() {
        let entries = vec![
            BatchEntry::now(dashboard(1)),
            BatchEntry::now(dashboard(2)),
            BatchEntry::now(dashboard(3)),
        ];
        let batch = PendingBatch::from_entries(entries).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.dashboard_snapshot.unwrap().aggregate_stats,
            json!({ "devices": 3 })
        );
    }

    #[test]
    fn test_created_at_is_earliest_entry() {
        let mut first = BatchEntry::now(dashboard(1));
        first.enqueued_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut second = BatchEntry::now(dashboard(2));
        second.enqueued_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();

        let batch = PendingBatch::from_entries(vec![second, first]).unwrap();
        assert_eq!(batch.created_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_update_tagged_json() {
        let update = BatchUpdate::Sensor(SensorUpdate {
            device_id: "d1".into(),
            sensor_id: "s1".into(),
            sensor_type: "temperature".to_string(),
            value: 21.5,
            captured_at: Utc.timestamp_opt(0, 0).unwrap(),
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["kind"], "sensor");
        assert_eq!(value["device_id"], "d1");
        let back: BatchUpdate = serde_json::from_value(value).unwrap();
        assert_eq!(back, update);
    }
}
