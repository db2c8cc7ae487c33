use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::time::Duration;

use lib_telemetry::error::{FanoutError, Result};
use lib_telemetry::models::{DeviceId, StatusSnapshot, SubscriberId};
use lib_telemetry::{Reading, ReadingBody, StatusProvider};

struct DeviceRecord {
    owner: SubscriberId,
    last_seen: DateTime<Utc>,
    reported: Option<StatusSnapshot>,
}

/// Derives device status from what the gateway has heard: the last reported
/// status label, downgraded to `offline` once a device has been silent for
/// longer than the online window.
pub struct LivenessProvider {
    devices: DashMap<DeviceId, DeviceRecord>,
    online_window: chrono::Duration,
}

impl LivenessProvider {
    pub fn new(online_window: Duration) -> Self {
        Self {
            devices: DashMap::new(),
            online_window: chrono::Duration::from_std(online_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    /// Records that a device spoke. Called for every admitted reading.
    pub fn observe(&self, reading: &Reading) {
        let seen = Utc::now();
        let mut record = self
            .devices
            .entry(reading.device_id.clone())
            .or_insert_with(|| DeviceRecord {
                owner: reading.subscriber_id.clone(),
                last_seen: seen,
                reported: None,
            });
        record.owner = reading.subscriber_id.clone();
        record.last_seen = record.last_seen.max(seen);
        if let ReadingBody::DeviceStatus {
            device_status,
            status_data,
        } = &reading.body
        {
            record.reported = Some(StatusSnapshot {
                device_status: device_status.clone(),
                status_data: status_data.clone(),
            });
        }
    }

    /// Forgets devices silent for longer than `max_silence`. Returns how many
    /// were dropped.
    pub fn evict_silent(&self, max_silence: Duration) -> usize {
        let Ok(max_silence) = chrono::Duration::from_std(max_silence) else {
            return 0;
        };
        let now = Utc::now();
        let before = self.devices.len();
        self.devices
            .retain(|_, record| now - record.last_seen <= max_silence);
        before.saturating_sub(self.devices.len())
    }

    fn is_online(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_seen <= self.online_window
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl StatusProvider for LivenessProvider {
    async fn device_status(&self, device_id: &DeviceId) -> Result<StatusSnapshot> {
        let record = self.devices.get(device_id).ok_or_else(|| {
            FanoutError::StatusProvider(format!("device {} has never reported", device_id))
        })?;

        let now = Utc::now();
        let online = self.is_online(record.last_seen, now);
        let label = match (&record.reported, online) {
            (_, false) => "offline".to_string(),
            (Some(reported), true) => reported.device_status.clone(),
            (None, true) => "online".to_string(),
        };
        let reported = record
            .reported
            .as_ref()
            .map(|r| r.status_data.clone())
            .unwrap_or(Value::Null);

        Ok(StatusSnapshot {
            device_status: label,
            status_data: json!({
                "online": online,
                "last_seen": record.last_seen,
                "reported": reported,
            }),
        })
    }

    async fn dashboard_summary(&self, subscriber_id: &SubscriberId) -> Result<Value> {
        let now = Utc::now();
        let (mut total, mut online) = (0u64, 0u64);
        for record in self.devices.iter() {
            if &record.owner != subscriber_id {
                continue;
            }
            total += 1;
            if self.is_online(record.last_seen, now) {
                online += 1;
            }
        }
        Ok(json!({
            "devices": total,
            "online": online,
            "offline": total - online,
            "computed_at": now,
        }))
    }
}
