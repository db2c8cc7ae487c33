//! # Topic Dispatcher
//!
//! Publishes server messages to every connection attached to a topic.
//!
//! A message is serialized once and the resulting `Arc<str>` is shared by all
//! receivers, so fan-out cost does not grow with payload size. Delivery is
//! at-most-once: a connection whose receiver is gone is pruned from the
//! registry on the spot and nothing is queued or retried on its behalf.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use crate::models::{ServerMessage, Topic};

/// Topic-addressed, best-effort publish primitive.
pub trait PubSubFanout: Send + Sync {
    /// Sends `message` to every connection attached to `topic` and returns how
    /// many received it.
    fn publish(&self, topic: &Topic, message: &ServerMessage) -> usize;
}

/// [`PubSubFanout`] over the in-process [`ConnectionRegistry`].
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Sends an already serialized frame.
    pub fn publish_raw(&self, topic: &Topic, frame: Arc<str>) -> usize {
        let mut delivered = 0;
        for (id, sender) in self.registry.senders_for(topic) {
            match sender.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    info!("Connection {} closed; pruning from {}", id, topic);
                    self.registry.disconnect(id);
                }
            }
        }
        debug!("Published {} bytes to {} ({} receivers)", frame.len(), topic, delivered);
        delivered
    }
}

impl PubSubFanout for Dispatcher {
    fn publish(&self, topic: &Topic, message: &ServerMessage) -> usize {
        match serde_json::to_string(message) {
            Ok(json) => self.publish_raw(topic, Arc::from(json)),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", topic, e);
                0
            }
        }
    }
}
