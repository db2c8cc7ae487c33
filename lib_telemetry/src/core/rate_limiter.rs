//! # Dual-Window Rate Limiter
//!
//! Admission control for device-originated traffic. Each origin owns one log
//! of uniquely tokenised admission events in the ephemeral store, read
//! through two sliding windows:
//!
//! - **burst**: a short period with a low ceiling (100 per 60 s by default);
//! - **sustained**: a long period with a higher ceiling (200 per 300 s).
//!
//! An event counts in a window while it is younger than the window period.
//! Recording appends to the log and reads both windows in one atomic store
//! step, so concurrent admissions for the same origin serialise.
//!
//! `admit` records first and checks second. The triggering request therefore
//! counts against its own decision, and denied requests keep consuming slots
//! until the caller backs off.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::configs::{FanoutConfig, KeySpace};
use crate::connections::EphemeralStore;
use crate::error::{FanoutError, Result};
use crate::models::DeviceId;
use crate::utils::start_of_next_minute;

#[derive(Debug, Clone, Copy)]
struct Window {
    ceiling: u64,
    period: Duration,
}

/// Live event counts of both windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowCounts {
    pub burst: u64,
    pub sustained: u64,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Counts including the event that triggered this decision.
    pub counts: WindowCounts,
    /// Set when the attempt was denied: the start of the next whole minute.
    pub retry_after: Option<DateTime<Utc>>,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.retry_after.is_none()
    }

    /// Turns a denial into [`FanoutError::AdmissionDenied`].
    pub fn into_result(self, origin: &DeviceId) -> Result<WindowCounts> {
        match self.retry_after {
            None => Ok(self.counts),
            Some(retry_after) => Err(FanoutError::AdmissionDenied {
                origin: origin.to_string(),
                retry_after,
            }),
        }
    }
}

fn window_counts(counts: &[u64]) -> Result<WindowCounts> {
    match counts {
        [burst, sustained] => Ok(WindowCounts {
            burst: *burst,
            sustained: *sustained,
        }),
        _ => Err(FanoutError::BackingStoreUnavailable(format!(
            "expected 2 window counts, store returned {}",
            counts.len()
        ))),
    }
}

/// Per-origin dual sliding-window limiter over an [`EphemeralStore`].
pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
    burst: Window,
    sustained: Window,
    keys: KeySpace,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn EphemeralStore>, config: &FanoutConfig) -> Self {
        Self {
            store,
            burst: Window {
                ceiling: config.burst_rate,
                period: config.burst_period(),
            },
            sustained: Window {
                ceiling: config.sustained_rate,
                period: config.sustained_period(),
            },
            keys: config.keys(),
        }
    }

    fn key(&self, origin: &DeviceId) -> String {
        self.keys.shared("rate", origin.as_str())
    }

    fn periods(&self) -> [Duration; 2] {
        [self.burst.period, self.sustained.period]
    }

    fn within_limits(&self, counts: WindowCounts) -> bool {
        counts.burst <= self.burst.ceiling && counts.sustained <= self.sustained.ceiling
    }

    /// Records one event and decides on it.
    ///
    /// Store failures propagate as [`FanoutError::BackingStoreUnavailable`];
    /// the caller must reject the request rather than let it through
    /// unmetered.
    pub async fn admit(&self, origin: &DeviceId) -> Result<Admission> {
        let counts = self.record(origin).await?;

        if self.within_limits(counts) {
            debug!(
                "Admitted {} (burst {}/{}, sustained {}/{})",
                origin, counts.burst, self.burst.ceiling, counts.sustained, self.sustained.ceiling
            );
            return Ok(Admission {
                counts,
                retry_after: None,
            });
        }

        let retry_after = start_of_next_minute(Utc::now());
        warn!(
            "Rate limit exceeded for {} (burst {}/{}, sustained {}/{}); retry after {}",
            origin,
            counts.burst,
            self.burst.ceiling,
            counts.sustained,
            self.sustained.ceiling,
            retry_after
        );
        Ok(Admission {
            counts,
            retry_after: Some(retry_after),
        })
    }

    /// Appends a uniquely tokenised event to the origin's log and returns
    /// the live counts of both windows.
    pub async fn record(&self, origin: &DeviceId) -> Result<WindowCounts> {
        let token = Uuid::new_v4().to_string();
        let counts = self
            .store
            .append_and_count(&self.key(origin), &token, &self.periods())
            .await?;
        window_counts(&counts)
    }

    /// Live counts without recording anything.
    pub async fn counts(&self, origin: &DeviceId) -> Result<WindowCounts> {
        let counts = self
            .store
            .count_windows(&self.key(origin), &self.periods())
            .await?;
        window_counts(&counts)
    }

    /// Whether the origin is currently within both ceilings.
    pub async fn check(&self, origin: &DeviceId) -> Result<bool> {
        Ok(self.within_limits(self.counts(origin).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), &FanoutConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_ceiling_and_recovery() {
        let limiter = limiter();
        let origin = DeviceId::from("dev-1");

        for _ in 0..100 {
            assert!(limiter.admit(&origin).await.unwrap().is_allowed());
        }
        let denied = limiter.admit(&origin).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.counts.burst, 101);
        assert!(denied.retry_after.unwrap() > Utc::now());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.admit(&origin).await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_attempts_still_count() {
        let limiter = limiter();
        let origin = DeviceId::from("dev-1");

        for _ in 0..105 {
            limiter.admit(&origin).await.unwrap();
        }
        let counts = limiter.counts(&origin).await.unwrap();
        assert_eq!(counts.burst, 105);
        assert!(!limiter.check(&origin).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_ceiling() {
        let limiter = limiter();
        let origin = DeviceId::from("dev-1");

        for _ in 0..100 {
            assert!(limiter.admit(&origin).await.unwrap().is_allowed());
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..100 {
            assert!(limiter.admit(&origin).await.unwrap().is_allowed());
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let denied = limiter.admit(&origin).await.unwrap();
        assert_eq!(denied.counts.burst, 1);
        assert_eq!(denied.counts.sustained, 201);
        assert!(matches!(
            denied.into_result(&origin),
            Err(FanoutError::AdmissionDenied { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_serialise() {
        let config = FanoutConfig {
            burst_rate: 1,
            sustained_rate: 1,
            ..FanoutConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new()), &config));
        let origin = DeviceId::from("dev-1");

        let (a, b) = tokio::join!(limiter.admit(&origin), limiter.admit(&origin));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.is_allowed(), b.is_allowed());
        for admission in [&a, &b] {
            assert_eq!(admission.counts.burst, admission.counts.sustained);
        }

        let mut handles = Vec::new();
        for i in 0..32 {
            let limiter = Arc::clone(&limiter);
            let origin = DeviceId::from(format!("dev-{}", i % 4 + 10));
            handles.push(tokio::spawn(async move { limiter.admit(&origin).await.unwrap() }));
        }
        let mut allowed = 0;
        for handle in handles {
            let admission = handle.await.unwrap();
            assert_eq!(admission.counts.burst, admission.counts.sustained);
            if admission.is_allowed() {
                allowed += 1;
            }
        }
        // One admission per origin.
        assert_eq!(allowed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_origins_are_independent() {
        let limiter = limiter();
        let noisy = DeviceId::from("noisy");
        let quiet = DeviceId::from("quiet");

        for _ in 0..120 {
            limiter.admit(&noisy).await.unwrap();
        }
        assert!(limiter.admit(&quiet).await.unwrap().is_allowed());
        assert_eq!(limiter.counts(&quiet).await.unwrap().burst, 1);
    }
}
