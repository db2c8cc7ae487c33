//! Shared doubles for the integration tests under `tests/`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lib_telemetry::models::{DeviceId, ServerMessage, StatusSnapshot, SubscriberId, Topic};
use lib_telemetry::{EphemeralStore, FanoutConfig, FanoutError, PubSubFanout, Result, StatusProvider};

/// Config with a short debounce so paused-time tests stay readable.
pub fn test_config() -> FanoutConfig {
    FanoutConfig {
        debounce_interval_ms: 100,
        ..FanoutConfig::default()
    }
}

/// Captures every publish instead of delivering it.
#[derive(Default)]
pub struct RecordingFanout {
    published: Mutex<Vec<(Topic, ServerMessage)>>,
}

impl RecordingFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(Topic, ServerMessage)> {
        self.published.lock().unwrap().clone()
    }

    pub fn on_topic(&self, topic: &Topic) -> Vec<ServerMessage> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m)
            .collect()
    }
}

impl PubSubFanout for RecordingFanout {
    fn publish(&self, topic: &Topic, message: &ServerMessage) -> usize {
        self.published
            .lock()
            .unwrap()
            .push((topic.clone(), message.clone()));
        1
    }
}

/// Answers from a fixed table. Unknown devices fail, as does the dashboard
/// until one is scripted.
#[derive(Default)]
pub struct ScriptedStatusProvider {
    statuses: Mutex<HashMap<DeviceId, StatusSnapshot>>,
    dashboard: Mutex<Option<Value>>,
}

impl ScriptedStatusProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, device: &str, label: &str, data: Value) -> Self {
        self.statuses.lock().unwrap().insert(
            DeviceId::from(device),
            StatusSnapshot {
                device_status: label.to_string(),
                status_data: data,
            },
        );
        self
    }

    pub fn with_dashboard(self, summary: Value) -> Self {
        *self.dashboard.lock().unwrap() = Some(summary);
        self
    }
}

#[async_trait]
impl StatusProvider for ScriptedStatusProvider {
    async fn device_status(&self, device_id: &DeviceId) -> Result<StatusSnapshot> {
        self.statuses
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| FanoutError::StatusProvider(format!("no status for {}", device_id)))
    }

    async fn dashboard_summary(&self, subscriber: &SubscriberId) -> Result<Value> {
        self.dashboard
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FanoutError::StatusProvider(format!("no dashboard for {}", subscriber)))
    }
}

/// A store whose backend is permanently down.
pub struct FailingStore;

fn down<T>() -> Result<T> {
    Err(FanoutError::BackingStoreUnavailable(
        "connection refused".to_string(),
    ))
}

#[async_trait]
impl EphemeralStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        down()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        down()
    }

    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
        down()
    }

    async fn append_and_count(
        &self,
        _key: &str,
        _token: &str,
        _windows: &[Duration],
    ) -> Result<Vec<u64>> {
        down()
    }

    async fn count_windows(&self, _key: &str, _windows: &[Duration]) -> Result<Vec<u64>> {
        down()
    }

    async fn push(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<u64> {
        down()
    }

    async fn drain_list(&self, _key: &str) -> Result<Vec<String>> {
        down()
    }
}
