//! # Batch Aggregator
//!
//! Buffers updates per subscriber between broadcasts. Every update is stored
//! as one JSON-encoded [`BatchEntry`] appended to the subscriber's list in the
//! ephemeral store, so concurrent producers never read-modify-write a shared
//! record. The typed [`PendingBatch`] is rebuilt from the list when drained.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::configs::{FanoutConfig, KeySpace};
use crate::connections::EphemeralStore;
use crate::error::Result;
use crate::models::{BatchEntry, BatchUpdate, PendingBatch, SubscriberId};

pub struct BatchAggregator {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
    keys: KeySpace,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn EphemeralStore>, config: &FanoutConfig) -> Self {
        Self {
            store,
            ttl: config.batch_ttl(),
            keys: config.keys(),
        }
    }

    fn key(&self, subscriber: &SubscriberId) -> String {
        self.keys.local("batch", subscriber.as_str())
    }

    /// Appends an update to the subscriber's batch, creating the batch if
    /// absent, and returns the number of buffered entries.
    pub async fn add(&self, subscriber: &SubscriberId, update: BatchUpdate) -> Result<u64> {
        let encoded = serde_json::to_string(&BatchEntry::now(update))?;
        let len = self.store.push(&self.key(subscriber), &encoded, self.ttl).await?;
        debug!("Buffered update for {} ({} pending)", subscriber, len);
        Ok(len)
    }

    /// Atomically takes the subscriber's batch. `None` when nothing was
    /// buffered.
    ///
    /// Entries that no longer decode are logged and skipped so one bad record
    /// cannot hold back the rest of the batch.
    pub async fn drain(&self, subscriber: &SubscriberId) -> Result<Option<PendingBatch>> {
        let raw = self.store.drain_list(&self.key(subscriber)).await?;
        let entries: Vec<BatchEntry> = raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Dropping undecodable batch entry for {}: {}", subscriber, e);
                    None
                }
            })
            .collect();
        Ok(PendingBatch::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryStore;
    use crate::models::{DashboardUpdate, SensorUpdate};
    use chrono::Utc;
    use serde_json::json;

    fn reading(value: f64) -> BatchUpdate {
        BatchUpdate::Sensor(SensorUpdate {
            device_id: "d1".into(),
            sensor_id: "s1".into(),
            sensor_type: "humidity".to_string(),
            value,
            captured_at: Utc::now(),
        })
    }

    fn aggregator(store: Arc<MemoryStore>) -> BatchAggregator {
        BatchAggregator::new(store, &FanoutConfig::default())
    }

    #[tokio::test]
    async fn test_drain_returns_typed_sections_then_clears() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        let user = SubscriberId::from("u1");

        agg.add(&user, reading(1.0)).await.unwrap();
        agg.add(
            &user,
            BatchUpdate::Dashboard(DashboardUpdate {
                aggregate_stats: json!({ "online": 3 }),
                captured_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        agg.add(&user, reading(2.0)).await.unwrap();

        let batch = agg.drain(&user).await.unwrap().unwrap();
        assert_eq!(batch.sensor_updates.len(), 2);
        assert_eq!(batch.sensor_updates[1].value, 2.0);
        assert!(batch.dashboard_snapshot.is_some());

        assert!(agg.drain(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_are_isolated() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        agg.add(&"u1".into(), reading(1.0)).await.unwrap();

        assert!(agg.drain(&"u2".into()).await.unwrap().is_none());
        assert!(agg.drain(&"u1".into()).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_batch_expires() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        let user = SubscriberId::from("u1");
        agg.add(&user, reading(1.0)).await.unwrap();

        tokio::time::advance(FanoutConfig::default().batch_ttl()).await;
        assert!(agg.drain(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(Arc::clone(&store));
        let user = SubscriberId::from("u1");

        agg.add(&user, reading(1.0)).await.unwrap();
        store
            .push("telemetry:batch:u1", "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        let batch = agg.drain(&user).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_seen_by_exactly_one_drain() {
        let agg = Arc::new(aggregator(Arc::new(MemoryStore::new())));
        let user = SubscriberId::from("u1");

        let mut producers = Vec::new();
        for worker in 0..4u32 {
            let agg = Arc::clone(&agg);
            let user = user.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50u32 {
                    agg.add(&user, reading(f64::from(worker * 100 + i))).await.unwrap();
                }
            }));
        }

        let mut seen = Vec::new();
        while producers.iter().any(|p| !p.is_finished()) {
            if let Some(batch) = agg.drain(&user).await.unwrap() {
                seen.extend(batch.sensor_updates.into_iter().map(|u| u.value as u32));
            }
            tokio::task::yield_now().await;
        }
        for p in producers {
            p.await.unwrap();
        }
        if let Some(batch) = agg.drain(&user).await.unwrap() {
            seen.extend(batch.sensor_updates.into_iter().map(|u| u.value as u32));
        }

        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..4)
            .flat_map(|w| (0..50).map(move |i| w * 100 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
