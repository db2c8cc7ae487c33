//! # Telemetry Ingestor
//!
//! Accepts one [`Reading`] at a time:
//!
//! 1. **Validate** ids and values. Nothing invalid reaches the limiter.
//! 2. **Admit** the origin device. A denial returns
//!    [`FanoutError::AdmissionDenied`] with a retry-after hint.
//! 3. **Add** the update to the owning subscriber's batch.
//! 4. **Notify** the scheduler so a flush is pending.
//!
//! Store failures at any step are returned as
//! [`FanoutError::BackingStoreUnavailable`] and the reading is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::core::{BatchAggregator, BroadcastScheduler, RateLimiter, WindowCounts};
use crate::error::{FanoutError, Result};
use crate::models::{
    BatchUpdate, DashboardUpdate, DeviceId, DeviceStatusUpdate, SensorId, SensorUpdate,
    StatusSnapshot, SubscriberId,
};

/// One telemetry message as posted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Origin device; also the rate-limited identity.
    pub device_id: DeviceId,
    /// Subscriber owning the device.
    pub subscriber_id: SubscriberId,
    /// Capture time on the device. Defaults to the time of receipt.
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: ReadingBody,
}

/// What a reading carries, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingBody {
    Sensor {
        sensor_id: SensorId,
        sensor_type: String,
        value: f64,
    },
    DeviceStatus {
        device_status: String,
        #[serde(default)]
        status_data: Value,
    },
    Dashboard {
        aggregate_stats: Value,
    },
}

impl Reading {
    /// Checks the reading before it is metered.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_blank() {
            return Err(FanoutError::InvalidReading("device_id is empty".into()));
        }
        if self.subscriber_id.is_blank() {
            return Err(FanoutError::InvalidReading("subscriber_id is empty".into()));
        }
        match &self.body {
            ReadingBody::Sensor {
                sensor_id,
                sensor_type,
                value,
            } => {
                if sensor_id.is_blank() {
                    return Err(FanoutError::InvalidReading("sensor_id is empty".into()));
                }
                if sensor_type.trim().is_empty() {
                    return Err(FanoutError::InvalidReading("sensor_type is empty".into()));
                }
                if !value.is_finite() {
                    return Err(FanoutError::InvalidReading(format!(
                        "sensor value {} is not a finite number",
                        value
                    )));
                }
            }
            ReadingBody::DeviceStatus { device_status, .. } => {
                if device_status.trim().is_empty() {
                    return Err(FanoutError::InvalidReading("device_status is empty".into()));
                }
            }
            ReadingBody::Dashboard { .. } => {}
        }
        Ok(())
    }

    /// Converts the reading into the update buffered for its subscriber.
    pub fn into_update(self) -> BatchUpdate {
        let captured_at = self.captured_at.unwrap_or_else(Utc::now);
        match self.body {
            ReadingBody::Sensor {
                sensor_id,
                sensor_type,
                value,
            } => BatchUpdate::Sensor(SensorUpdate {
                device_id: self.device_id,
                sensor_id,
                sensor_type,
                value,
                captured_at,
            }),
            ReadingBody::DeviceStatus {
                device_status,
                status_data,
            } => BatchUpdate::DeviceStatus(DeviceStatusUpdate {
                device_id: self.device_id,
                status_snapshot: StatusSnapshot {
                    device_status,
                    status_data,
                },
                captured_at,
            }),
            ReadingBody::Dashboard { aggregate_stats } => BatchUpdate::Dashboard(DashboardUpdate {
                aggregate_stats,
                captured_at,
            }),
        }
    }
}

/// Acknowledgement of an accepted reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    /// Window counts after this reading.
    pub burst_count: u64,
    pub sustained_count: u64,
    /// Updates now waiting for the subscriber.
    pub pending: u64,
    /// Whether this reading armed the subscriber's next flush.
    pub flush_armed: bool,
}

/// The admit → add → notify pipeline.
#[derive(Clone)]
pub struct TelemetryIngestor {
    limiter: Arc<RateLimiter>,
    aggregator: Arc<BatchAggregator>,
    scheduler: BroadcastScheduler,
}

impl TelemetryIngestor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        aggregator: Arc<BatchAggregator>,
        scheduler: BroadcastScheduler,
    ) -> Self {
        Self {
            limiter,
            aggregator,
            scheduler,
        }
    }

    pub async fn ingest(&self, reading: Reading) -> Result<IngestReceipt> {
        reading.validate()?;

        let origin = reading.device_id.clone();
        let subscriber = reading.subscriber_id.clone();
        let WindowCounts { burst, sustained } =
            self.limiter.admit(&origin).await?.into_result(&origin)?;

        let pending = self.aggregator.add(&subscriber, reading.into_update()).await?;
        let flush_armed = self.scheduler.notify(&subscriber).await?;
        debug!(
            "Ingested reading from {} for {} (pending {}, armed {})",
            origin, subscriber, pending, flush_armed
        );

        Ok(IngestReceipt {
            burst_count: burst,
            sustained_count: sustained,
            pending,
            flush_armed,
        })
    }
}
