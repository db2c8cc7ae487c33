//! # Fan-out Configuration
//!
//! `FanoutConfig` is deserialisable from the server's camelCase JSON file and
//! falls back to production defaults for every missing field.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FanoutError, Result};

/// Upper bound on every period and TTL, one week.
pub const MAX_DURATION_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Core tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutConfig {
    /// Ceiling of the short window.
    pub burst_rate: u64,
    pub burst_period_seconds: u64,
    /// Ceiling of the long window.
    pub sustained_rate: u64,
    pub sustained_period_seconds: u64,
    /// Delay between the first buffered update and the forced flush.
    pub debounce_interval_ms: u64,
    /// Lifetime of a schedule marker. Must cover the debounce interval.
    pub marker_ttl_seconds: u64,
    /// Lifetime of an untouched pending batch.
    pub batch_ttl_seconds: u64,
    /// Namespace of every store key.
    pub key_prefix: String,
    /// Scopes batches and markers to one gateway instance when several share
    /// a store. Rate windows stay shared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            burst_rate: 100,
            burst_period_seconds: 60,
            sustained_rate: 200,
            sustained_period_seconds: 300,
            debounce_interval_ms: 5_000,
            marker_ttl_seconds: 10,
            batch_ttl_seconds: 60,
            key_prefix: "telemetry".to_string(),
            instance_id: None,
        }
    }
}

impl FanoutConfig {
    pub fn burst_period(&self) -> Duration {
        Duration::from_secs(self.burst_period_seconds)
    }

    pub fn sustained_period(&self) -> Duration {
        Duration::from_secs(self.sustained_period_seconds)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_seconds)
    }

    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_seconds)
    }

    /// Rejects values that would break the rate windows or leave a pending
    /// batch without a scheduled flush.
    pub fn validate(&self) -> Result<()> {
        if self.burst_rate == 0 || self.sustained_rate == 0 {
            return Err(FanoutError::Config("rates must be greater than zero".into()));
        }
        if self.burst_period_seconds == 0 || self.sustained_period_seconds == 0 {
            return Err(FanoutError::Config("rate periods must be greater than zero".into()));
        }
        if self.debounce_interval_ms == 0 {
            return Err(FanoutError::Config("debounceIntervalMs must be greater than zero".into()));
        }
        if self.marker_ttl() < self.debounce_interval() {
            return Err(FanoutError::Config(format!(
                "markerTtlSeconds ({}s) must not be shorter than debounceIntervalMs ({}ms)",
                self.marker_ttl_seconds, self.debounce_interval_ms
            )));
        }
        if self.batch_ttl() < self.debounce_interval() {
            return Err(FanoutError::Config(format!(
                "batchTtlSeconds ({}s) must not be shorter than debounceIntervalMs ({}ms)",
                self.batch_ttl_seconds, self.debounce_interval_ms
            )));
        }
        for (name, seconds) in [
            ("burstPeriodSeconds", self.burst_period_seconds),
            ("sustainedPeriodSeconds", self.sustained_period_seconds),
            ("markerTtlSeconds", self.marker_ttl_seconds),
            ("batchTtlSeconds", self.batch_ttl_seconds),
            ("debounceIntervalMs", self.debounce_interval_ms / 1_000),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(FanoutError::Config(format!(
                    "{} exceeds {}s",
                    name, MAX_DURATION_SECONDS
                )));
            }
        }
        if self.key_prefix.trim().is_empty() {
            return Err(FanoutError::Config("keyPrefix must not be empty".into()));
        }
        if let Some(instance) = &self.instance_id {
            if instance.trim().is_empty() || instance.contains(':') {
                return Err(FanoutError::Config(
                    "instanceId must be non-empty and must not contain ':'".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace {
            prefix: self.key_prefix.clone(),
            instance: self.instance_id.clone(),
        }
    }
}

/// Store key layout of one core.
///
/// Shared keys (`telemetry:rate:d1`) are seen by every instance on the same
/// store. Local keys (`telemetry:gw-1:batch:u1`) carry the instance id when
/// one is configured, so a batch is always flushed by the instance that
/// buffered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    instance: Option<String>,
}

impl KeySpace {
    pub fn shared(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, id)
    }

    pub fn local(&self, kind: &str, id: &str) -> String {
        match &self.instance {
            Some(instance) => format!("{}:{}:{}:{}", self.prefix, instance, kind, id),
            None => self.shared(kind, id),
        }
    }
}
