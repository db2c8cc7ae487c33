use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lib_telemetry::core::{RegistryStats, SchedulerSnapshot};

/// Client → server control frame on the WebSocket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    pub subscribe: Option<Vec<String>>,
    pub unsubscribe: Option<Vec<String>>,
}

/// Body of a rejected ingestion request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

/// Body of `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsBody {
    pub started_at: DateTime<Utc>,
    pub store: &'static str,
    pub registry: RegistryStats,
    pub scheduler: SchedulerSnapshot,
    pub known_devices: usize,
}
