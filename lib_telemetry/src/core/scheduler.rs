//! # Broadcast Scheduler
//!
//! Debounces broadcasts per subscriber. The first `notify` after an idle
//! period takes the subscriber's schedule marker with an atomic test-and-set
//! and arms one deferred task; every later `notify` in the same window finds
//! the marker and does nothing, because the pending flush will pick its update
//! up too.
//!
//! ```text
//!  IDLE --notify (marker taken)--> PENDING --debounce elapsed, flush--> IDLE
//! ```
//!
//! The flush releases the marker *before* draining the batch. An update that
//! lands after the drain then arms a fresh cycle instead of waiting on a
//! marker that is about to disappear. The marker expires on its own after
//! `marker_ttl`, so a task lost with its process cannot wedge a subscriber in
//! PENDING.
//!
//! Flush-time failures never reach the `notify` caller, who has long returned.
//! They are logged and counted in [`SchedulerStats`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::aggregator::BatchAggregator;
use super::dispatcher::PubSubFanout;
use super::registry::ConnectionRegistry;
use crate::configs::{FanoutConfig, KeySpace};
use crate::connections::EphemeralStore;
use crate::error::Result;
use crate::models::{
    ConsolidatedPayload, ConsolidatedUpdates, ServerMessage, SubscriberId, Topic,
};
use crate::providers::StatusProvider;

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No batch was pending, or nothing survived status refresh.
    Empty,
    /// The subscriber had no live connection; the batch was dropped.
    NoLiveSubscriber { discarded: usize },
    /// The consolidated payload went out.
    Published { updates: usize, deliveries: usize },
    /// The store or serializer failed; the batch may be lost.
    Failed(String),
}

/// Monotonic scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    armed: AtomicU64,
    coalesced: AtomicU64,
    empty: AtomicU64,
    discarded: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    provider_failures: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub armed: u64,
    pub coalesced: u64,
    pub empty: u64,
    pub discarded: u64,
    pub published: u64,
    pub failed: u64,
    pub provider_failures: u64,
    pub in_flight: usize,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct SchedulerInner {
    store: Arc<dyn EphemeralStore>,
    aggregator: Arc<BatchAggregator>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<dyn PubSubFanout>,
    provider: Arc<dyn StatusProvider>,
    debounce: Duration,
    marker_ttl: Duration,
    keys: KeySpace,
    stats: SchedulerStats,
}

/// Per-subscriber debounce over the shared store. Cheap to clone; clones
/// share the marker namespace, the counters and the task tracker.
#[derive(Clone)]
pub struct BroadcastScheduler {
    inner: Arc<SchedulerInner>,
    tracker: TaskTracker,
}

impl BroadcastScheduler {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        aggregator: Arc<BatchAggregator>,
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<dyn PubSubFanout>,
        provider: Arc<dyn StatusProvider>,
        config: &FanoutConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                aggregator,
                registry,
                fanout,
                provider,
                debounce: config.debounce_interval(),
                marker_ttl: config.marker_ttl(),
                keys: config.keys(),
                stats: SchedulerStats::default(),
            }),
            tracker: TaskTracker::new(),
        }
    }

    fn marker_key(&self, subscriber: &SubscriberId) -> String {
        self.inner.keys.local("marker", subscriber.as_str())
    }

    /// Arms a deferred flush unless one is already pending. Returns `true`
    /// when this call armed it.
    pub async fn notify(&self, subscriber: &SubscriberId) -> Result<bool> {
        let taken = self
            .inner
            .store
            .set_if_absent(&self.marker_key(subscriber), "1", self.inner.marker_ttl)
            .await?;

        if !taken {
            SchedulerStats::bump(&self.inner.stats.coalesced);
            debug!("Flush already pending for {}", subscriber);
            return Ok(false);
        }

        SchedulerStats::bump(&self.inner.stats.armed);
        debug!("Armed flush for {} in {:?}", subscriber, self.inner.debounce);

        let this = self.clone();
        let subscriber = subscriber.clone();
        self.tracker.spawn(async move {
            tokio::time::sleep(this.inner.debounce).await;
            this.flush(&subscriber).await;
        });
        Ok(true)
    }

    /// Drains and broadcasts the subscriber's batch. Never fails; problems
    /// are reported through the outcome, the log and the counters.
    pub async fn flush(&self, subscriber: &SubscriberId) -> FlushOutcome {
        let stats = &self.inner.stats;
        let outcome = match self.try_flush(subscriber).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Flush for {} failed: {}", subscriber, e);
                FlushOutcome::Failed(e.to_string())
            }
        };

        match &outcome {
            FlushOutcome::Empty => SchedulerStats::bump(&stats.empty),
            FlushOutcome::NoLiveSubscriber { .. } => SchedulerStats::bump(&stats.discarded),
            FlushOutcome::Published { .. } => SchedulerStats::bump(&stats.published),
            FlushOutcome::Failed(_) => SchedulerStats::bump(&stats.failed),
        }
        debug!("Flush for {} finished: {:?}", subscriber, outcome);
        outcome
    }

    async fn try_flush(&self, subscriber: &SubscriberId) -> Result<FlushOutcome> {
        self.inner.store.delete(&self.marker_key(subscriber)).await?;

        let Some(batch) = self.inner.aggregator.drain(subscriber).await? else {
            return Ok(FlushOutcome::Empty);
        };

        if !self.inner.registry.has_live_connection(subscriber) {
            debug!(
                "Discarding {} update(s) for disconnected subscriber {}",
                batch.len(),
                subscriber
            );
            return Ok(FlushOutcome::NoLiveSubscriber {
                discarded: batch.len(),
            });
        }

        let mut updates = ConsolidatedUpdates::from_batch(&batch);
        self.refresh_statuses(&mut updates).await;
        self.refresh_dashboard(subscriber, &mut updates).await;
        if updates.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let payload = ConsolidatedPayload::new(updates);
        let sections = payload.sections(subscriber);
        let mut deliveries = self
            .inner
            .fanout
            .publish(&Topic::User(subscriber.clone()), &ServerMessage::BatchUpdate(payload));

        let attached = self.inner.registry.topics_for(subscriber);
        for (topic, message) in sections {
            if attached.contains(&topic) {
                deliveries += self.inner.fanout.publish(&topic, &message);
            }
        }

        Ok(FlushOutcome::Published {
            updates: batch.len(),
            deliveries,
        })
    }

    /// Replaces reported statuses with the provider's view. A device the
    /// provider fails on is left out of the payload.
    async fn refresh_statuses(&self, updates: &mut ConsolidatedUpdates) {
        let Some(statuses) = updates.device_status.as_mut() else {
            return;
        };

        let mut failed = Vec::new();
        for (device_id, entry) in statuses.iter_mut() {
            match self.inner.provider.device_status(device_id).await {
                Ok(snapshot) => *entry = entry.refreshed(snapshot),
                Err(e) => {
                    warn!("Status provider failed for device {}: {}", device_id, e);
                    SchedulerStats::bump(&self.inner.stats.provider_failures);
                    failed.push(device_id.clone());
                }
            }
        }
        for device_id in failed {
            statuses.remove(&device_id);
        }
        if statuses.is_empty() {
            updates.device_status = None;
        }
    }

    /// Prefers a freshly computed dashboard over the buffered one, falling
    /// back to the buffered snapshot when the provider fails.
    async fn refresh_dashboard(&self, subscriber: &SubscriberId, updates: &mut ConsolidatedUpdates) {
        let Some(dashboard) = updates.dashboard.as_mut() else {
            return;
        };
        match self.inner.provider.dashboard_summary(subscriber).await {
            Ok(summary) => *dashboard = summary,
            Err(e) => {
                warn!("Status provider failed for dashboard of {}: {}", subscriber, e);
                SchedulerStats::bump(&self.inner.stats.provider_failures);
            }
        }
    }

    pub fn stats(&self) -> SchedulerSnapshot {
        let s = &self.inner.stats;
        SchedulerSnapshot {
            armed: s.armed.load(Ordering::Relaxed),
            coalesced: s.coalesced.load(Ordering::Relaxed),
            empty: s.empty.load(Ordering::Relaxed),
            discarded: s.discarded.load(Ordering::Relaxed),
            published: s.published.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            provider_failures: s.provider_failures.load(Ordering::Relaxed),
            in_flight: self.tracker.len(),
        }
    }

    /// Waits for every armed flush to run. Flushes armed after this call are
    /// still tracked but no longer awaited.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryStore;
    use crate::error::FanoutError;
    use crate::models::{
        BatchUpdate, DeviceId, DeviceStatusUpdate, SensorId, SensorUpdate, StatusSnapshot,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Topic, ServerMessage)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(Topic, ServerMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl PubSubFanout for Recorder {
        fn publish(&self, topic: &Topic, message: &ServerMessage) -> usize {
            self.sent.lock().unwrap().push((topic.clone(), message.clone()));
            1
        }
    }

    /// Reports "computed" for every device except `bad`.
    struct Provider {
        bad: Option<DeviceId>,
    }

    #[async_trait]
    impl StatusProvider for Provider {
        async fn device_status(&self, device_id: &DeviceId) -> Result<StatusSnapshot> {
            if self.bad.as_ref() == Some(device_id) {
                return Err(FanoutError::StatusProvider("boom".into()));
            }
            Ok(StatusSnapshot {
                device_status: "computed".into(),
                status_data: Value::Null,
            })
        }

        async fn dashboard_summary(&self, _: &SubscriberId) -> Result<Value> {
            Ok(json!({ "fresh": true }))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        aggregator: Arc<BatchAggregator>,
        registry: Arc<ConnectionRegistry>,
        recorder: Arc<Recorder>,
        scheduler: BroadcastScheduler,
    }

    fn fixture(bad: Option<&str>) -> Fixture {
        let config = FanoutConfig::default();
        let store = Arc::new(MemoryStore::new());
        let aggregator = Arc::new(BatchAggregator::new(store.clone(), &config));
        let registry = Arc::new(ConnectionRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let scheduler = BroadcastScheduler::new(
            store.clone(),
            aggregator.clone(),
            registry.clone(),
            recorder.clone(),
            Arc::new(Provider {
                bad: bad.map(DeviceId::from),
            }),
            &config,
        );
        Fixture {
            store,
            aggregator,
            registry,
            recorder,
            scheduler,
        }
    }

    fn sensor(device: &str, value: f64) -> BatchUpdate {
        BatchUpdate::Sensor(SensorUpdate {
            device_id: device.into(),
            sensor_id: "s1".into(),
            sensor_type: "temperature".into(),
            value,
            captured_at: Utc::now(),
        })
    }

    fn status(device: &str) -> BatchUpdate {
        BatchUpdate::DeviceStatus(DeviceStatusUpdate {
            device_id: device.into(),
            status_snapshot: StatusSnapshot {
                device_status: "reported".into(),
                status_data: Value::Null,
            },
            captured_at: Utc::now(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifies_in_one_window_share_a_flush() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        let _conn = f.registry.connect(&user);

        let mut armed = 0;
        for i in 0..3u32 {
            f.aggregator.add(&user, sensor("d1", f64::from(i))).await.unwrap();
            if f.scheduler.notify(&user).await.unwrap() {
                armed += 1;
            }
        }
        assert_eq!(armed, 1);
        assert!(f.recorder.take().is_empty());

        tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        f.scheduler.shutdown().await;

        let sent = f.recorder.take();
        assert_eq!(sent.len(), 1);
        let (topic, ServerMessage::BatchUpdate(payload)) = &sent[0] else {
            panic!("expected a batch update, got {:?}", sent[0]);
        };
        assert_eq!(*topic, Topic::User(user));
        let sensors = payload.updates.sensor_data.as_ref().unwrap();
        let series = &sensors[&DeviceId::from("d1")][&SensorId::from("s1")];
        assert_eq!(series.data_points.len(), 3);

        let stats = f.scheduler.stats();
        assert_eq!((stats.armed, stats.coalesced, stats.published), (1, 2, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_notifies_arm_once() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let scheduler = f.scheduler.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move { scheduler.notify(&user).await.unwrap() }));
        }
        let mut armed = 0;
        for h in handles {
            if h.await.unwrap() {
                armed += 1;
            }
        }
        assert_eq!(armed, 1);
        assert_eq!(f.scheduler.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_flush_without_connection_discards() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        f.aggregator.add(&user, sensor("d1", 1.0)).await.unwrap();

        let outcome = f.scheduler.flush(&user).await;
        assert_eq!(outcome, FlushOutcome::NoLiveSubscriber { discarded: 1 });
        assert!(f.recorder.take().is_empty());
        assert!(f.aggregator.drain(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_of_nothing_is_empty() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        let _conn = f.registry.connect(&user);
        assert_eq!(f.scheduler.flush(&user).await, FlushOutcome::Empty);
    }

    #[tokio::test]
    async fn test_flush_releases_marker_for_next_cycle() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        assert!(f.scheduler.notify(&user).await.unwrap());
        assert!(!f.scheduler.notify(&user).await.unwrap());

        f.scheduler.flush(&user).await;
        assert!(f.scheduler.notify(&user).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_marker_expires() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        // A marker left behind by a process that died before its flush ran.
        f.store
            .set_if_absent("telemetry:marker:u1", "1", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!f.scheduler.notify(&user).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(f.scheduler.notify(&user).await.unwrap());
    }

    #[tokio::test]
    async fn test_provider_failure_drops_only_that_device() {
        let f = fixture(Some("d1"));
        let user = SubscriberId::from("u1");
        let _conn = f.registry.connect(&user);

        f.aggregator.add(&user, status("d1")).await.unwrap();
        f.aggregator.add(&user, status("d2")).await.unwrap();
        f.aggregator.add(&user, sensor("d1", 4.2)).await.unwrap();

        let outcome = f.scheduler.flush(&user).await;
        assert!(matches!(outcome, FlushOutcome::Published { updates: 3, .. }));

        let sent = f.recorder.take();
        let ServerMessage::BatchUpdate(payload) = &sent[0].1 else {
            panic!("expected a batch update");
        };
        let statuses = payload.updates.device_status.as_ref().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[&DeviceId::from("d2")].device_status, "computed");
        assert!(payload.updates.sensor_data.is_some());
        assert_eq!(f.scheduler.stats().provider_failures, 1);
    }

    #[tokio::test]
    async fn test_sections_only_reach_attached_topics() {
        let f = fixture(None);
        let user = SubscriberId::from("u1");
        let conn = f.registry.connect(&user);
        f.registry
            .subscribe(conn.id, &["device:d1".parse().unwrap()])
            .unwrap();

        f.aggregator.add(&user, status("d1")).await.unwrap();
        f.aggregator.add(&user, sensor("d1", 1.0)).await.unwrap();
        f.scheduler.flush(&user).await;

        let topics: Vec<String> = f
            .recorder
            .take()
            .into_iter()
            .map(|(t, _)| t.to_string())
            .collect();
        assert_eq!(topics, vec!["user:u1", "device:d1"]);
    }
}
