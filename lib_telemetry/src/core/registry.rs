//! # Connection Registry
//!
//! Tracks live transport connections, the subscriber each one belongs to, and
//! the topics each one is attached to. Three sharded indexes are kept in step
//! on connect, disconnect, subscribe and unsubscribe:
//!
//! - connection id → handle (sender, owner, topics, last activity);
//! - subscriber → connection ids, for O(1) liveness checks;
//! - topic → connection ids, for publishing.
//!
//! Every connection is attached to its owner's consolidated topic
//! (`user:{id}`) for its whole life. Topics owned by another subscriber are
//! refused.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FanoutError, Result};
use crate::models::{SubscriberId, Topic};

/// Identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The transport side of a registered connection. Serialized messages for
/// every attached topic arrive on `receiver`.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub subscriber: SubscriberId,
    pub receiver: mpsc::UnboundedReceiver<Arc<str>>,
}

struct ConnectionHandle {
    subscriber: SubscriberId,
    sender: mpsc::UnboundedSender<Arc<str>>,
    topics: BTreeSet<Topic>,
    last_seen: Instant,
}

/// Counters exposed on the operations endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub subscribers: usize,
    pub topics: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    by_subscriber: DashMap<SubscriberId, HashSet<ConnectionId>>,
    by_topic: DashMap<Topic, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, topic: &Topic, id: ConnectionId) {
        self.by_topic.entry(topic.clone()).or_default().insert(id);
    }

    fn detach(&self, topic: &Topic, id: ConnectionId) {
        if let Some(mut ids) = self.by_topic.get_mut(topic) {
            ids.remove(&id);
        }
        self.by_topic.remove_if(topic, |_, ids| ids.is_empty());
    }

    /// Registers a connection for `subscriber`, attached to `user:{id}`.
    pub fn connect(&self, subscriber: &SubscriberId) -> Connection {
        let id = ConnectionId::generate();
        let (sender, receiver) = mpsc::unbounded_channel();
        let home = Topic::User(subscriber.clone());

        // Indexes first: a disconnect can only start once the handle exists.
        self.by_subscriber
            .entry(subscriber.clone())
            .or_default()
            .insert(id);
        self.attach(&home, id);
        self.connections.insert(
            id,
            ConnectionHandle {
                subscriber: subscriber.clone(),
                sender,
                topics: BTreeSet::from([home]),
                last_seen: Instant::now(),
            },
        );

        info!("Connection {} registered for subscriber {}", id, subscriber);
        Connection {
            id,
            subscriber: subscriber.clone(),
            receiver,
        }
    }

    /// Removes a connection and every index entry pointing at it. Returns
    /// whether it was registered.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return false;
        };

        for topic in &handle.topics {
            self.detach(topic, id);
        }
        if let Some(mut ids) = self.by_subscriber.get_mut(&handle.subscriber) {
            ids.remove(&id);
        }
        self.by_subscriber
            .remove_if(&handle.subscriber, |_, ids| ids.is_empty());

        info!(
            "Connection {} of subscriber {} removed",
            id, handle.subscriber
        );
        true
    }

    /// Attaches a connection to extra topics. Returns the topics that are now
    /// attached, in order; foreign topics are skipped.
    ///
    /// The topic index is updated while the handle is held, so a concurrent
    /// `disconnect` sees every attached topic. Lock order is always
    /// `connections` then `by_topic`.
    pub fn subscribe(&self, id: ConnectionId, topics: &[Topic]) -> Result<Vec<Topic>> {
        let mut accepted = Vec::with_capacity(topics.len());
        let mut handle = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| FanoutError::ConnectionNotFound(id.to_string()))?;
        handle.last_seen = Instant::now();

        for topic in topics {
            if topic
                .owner()
                .is_some_and(|owner| owner != &handle.subscriber)
            {
                warn!(
                    "Connection {} of {} refused foreign topic {}",
                    id, handle.subscriber, topic
                );
                continue;
            }
            handle.topics.insert(topic.clone());
            self.attach(topic, id);
            accepted.push(topic.clone());
        }
        drop(handle);

        debug!("Connection {} subscribed to {:?}", id, accepted);
        Ok(accepted)
    }

    /// Detaches a connection from topics. The consolidated topic cannot be
    /// left. Returns the topics that were actually detached.
    pub fn unsubscribe(&self, id: ConnectionId, topics: &[Topic]) -> Result<Vec<Topic>> {
        let mut removed = Vec::with_capacity(topics.len());
        let mut handle = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| FanoutError::ConnectionNotFound(id.to_string()))?;
        handle.last_seen = Instant::now();

        let home = Topic::User(handle.subscriber.clone());
        for topic in topics {
            if *topic != home && handle.topics.remove(topic) {
                self.detach(topic, id);
                removed.push(topic.clone());
            }
        }
        drop(handle);

        debug!("Connection {} unsubscribed from {:?}", id, removed);
        Ok(removed)
    }

    /// Whether the subscriber has at least one registered connection.
    pub fn has_live_connection(&self, subscriber: &SubscriberId) -> bool {
        self.by_subscriber
            .get(subscriber)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// The consolidated topic plus every topic any of the subscriber's
    /// connections is attached to.
    pub fn topics_for(&self, subscriber: &SubscriberId) -> BTreeSet<Topic> {
        let ids: Vec<ConnectionId> = match self.by_subscriber.get(subscriber) {
            Some(ids) => ids.iter().copied().collect(),
            None => Vec::new(),
        };

        let mut topics = BTreeSet::from([Topic::User(subscriber.clone())]);
        for id in ids {
            if let Some(handle) = self.connections.get(&id) {
                topics.extend(handle.topics.iter().cloned());
            }
        }
        topics
    }

    /// Connections attached to `topic`.
    pub fn connections_for(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.by_topic
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Senders of the connections attached to `topic`.
    pub(crate) fn senders_for(
        &self,
        topic: &Topic,
    ) -> Vec<(ConnectionId, mpsc::UnboundedSender<Arc<str>>)> {
        self.connections_for(topic)
            .into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .map(|handle| (id, handle.sender.clone()))
            })
            .collect()
    }

    /// Marks a connection as active (a frame or heartbeat was received).
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut handle) => {
                handle.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evicts connections idle for longer than `max_idle` or whose receiver
    /// is gone. Returns the evicted ids.
    pub fn cleanup_stale(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| {
                entry.sender.is_closed() || now.duration_since(entry.last_seen) > max_idle
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            self.disconnect(*id);
        }
        if !stale.is_empty() {
            info!("Evicted {} stale connection(s)", stale.len());
        }
        stale
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            subscribers: self.by_subscriber.len(),
            topics: self.by_topic.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        s.parse().unwrap()
    }

    #[test]
    fn test_connect_attaches_consolidated_topic() {
        let registry = ConnectionRegistry::new();
        let user = SubscriberId::from("u1");
        assert!(!registry.has_live_connection(&user));

        let conn = registry.connect(&user);
        assert!(registry.has_live_connection(&user));
        assert_eq!(registry.connections_for(&topic("user:u1")), vec![conn.id]);

        assert!(registry.disconnect(conn.id));
        assert!(!registry.has_live_connection(&user));
        assert!(registry.connections_for(&topic("user:u1")).is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let registry = ConnectionRegistry::new();
        let user = SubscriberId::from("u1");
        let conn = registry.connect(&user);

        let accepted = registry
            .subscribe(
                conn.id,
                &[topic("device:d1"), topic("sensor:s1"), topic("user:u1:dashboard")],
            )
            .unwrap();
        assert_eq!(accepted.len(), 3);
        assert_eq!(registry.topics_for(&user).len(), 4);

        let removed = registry
            .unsubscribe(conn.id, &[topic("sensor:s1"), topic("user:u1")])
            .unwrap();
        assert_eq!(removed, vec![topic("sensor:s1")]);
        assert!(registry.connections_for(&topic("sensor:s1")).is_empty());
        assert!(registry.topics_for(&user).contains(&topic("user:u1")));
    }

    #[test]
    fn test_foreign_topics_refused() {
        let registry = ConnectionRegistry::new();
        let conn = registry.connect(&"u1".into());

        let accepted = registry
            .subscribe(conn.id, &[topic("user:u2"), topic("user:u2:dashboard")])
            .unwrap();
        assert!(accepted.is_empty());
        assert!(registry.connections_for(&topic("user:u2")).is_empty());
    }

    #[test]
    fn test_unknown_connection_is_an_error() {
        let registry = ConnectionRegistry::new();
        let conn = registry.connect(&"u1".into());
        registry.disconnect(conn.id);

        assert!(matches!(
            registry.subscribe(conn.id, &[topic("device:d1")]),
            Err(FanoutError::ConnectionNotFound(_))
        ));
        assert!(!registry.disconnect(conn.id));
    }

    #[test]
    fn test_topics_union_across_connections() {
        let registry = ConnectionRegistry::new();
        let user = SubscriberId::from("u1");
        let phone = registry.connect(&user);
        let laptop = registry.connect(&user);

        registry.subscribe(phone.id, &[topic("device:d1")]).unwrap();
        registry.subscribe(laptop.id, &[topic("device:d2")]).unwrap();
        let topics = registry.topics_for(&user);
        assert!(topics.contains(&topic("device:d1")));
        assert!(topics.contains(&topic("device:d2")));

        registry.disconnect(phone.id);
        assert!(registry.has_live_connection(&user));
        assert!(!registry.topics_for(&user).contains(&topic("device:d1")));
    }

    #[test]
    fn test_disconnect_racing_subscribe_leaves_no_topic_entry() {
        let registry = ConnectionRegistry::new();
        let topics: Vec<Topic> = (0..8).map(|i| topic(&format!("device:d{}", i))).collect();

        for _ in 0..200 {
            let id = registry.connect(&"u1".into()).id;
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let _ = registry.subscribe(id, &topics);
                });
                scope.spawn(|| {
                    registry.disconnect(id);
                });
            });
        }

        assert_eq!(registry.stats(), RegistryStats::default());
        for t in &topics {
            assert!(registry.connections_for(t).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stale_by_idle_time_and_closed_receiver() {
        let registry = ConnectionRegistry::new();
        let idle = registry.connect(&"u1".into());
        let active = registry.connect(&"u2".into());
        let dropped = registry.connect(&"u3".into());
        drop(dropped.receiver);

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.touch(active.id);
        tokio::time::advance(Duration::from_secs(15)).await;

        let mut evicted = registry.cleanup_stale(Duration::from_secs(30));
        evicted.sort();
        let mut expected = vec![idle.id, dropped.id];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(registry.stats().connections, 1);
        assert!(registry.has_live_connection(&"u2".into()));
    }
}
