//! # lib_telemetry
//!
//! Real-time telemetry fan-out core. Device traffic is metered per origin,
//! buffered per subscriber, and broadcast as one consolidated message per
//! debounce window to every live connection of that subscriber.
//!
//! ```text
//! Reading -> RateLimiter::admit -> BatchAggregator::add -> BroadcastScheduler::notify
//!                                                                |
//!                                               (debounce interval elapses)
//!                                                                v
//!            PubSubFanout::publish <- StatusProvider <- BatchAggregator::drain
//! ```
//!
//! Shared state lives behind [`connections::EphemeralStore`]: the in-memory
//! backend is always available, the Redis backend needs the `connections`
//! feature.

#![forbid(unsafe_code)]

/// Rate windows, debounce timing and key layout.
pub mod configs;
/// Ephemeral key-value backends.
pub mod connections;
/// Rate limiter, aggregator, scheduler, registry and dispatcher.
pub mod core;
/// Error taxonomy of the fan-out core.
pub mod error;
/// Reading validation and the ingestion pipeline.
pub mod ingestors;
/// Identifiers, topics, buffered updates and payloads.
pub mod models;
/// The status provider seam.
pub mod providers;
/// Wall-clock helpers.
pub mod utils;

pub use configs::FanoutConfig;
pub use connections::{EphemeralStore, MemoryStore};
#[cfg(feature = "connections")]
pub use connections::RedisStore;
pub use crate::core::{
    BatchAggregator, BroadcastScheduler, Connection, ConnectionId, ConnectionRegistry, Dispatcher,
    FanoutCore, FlushOutcome, PubSubFanout, RateLimiter,
};
pub use error::{FanoutError, Result};
pub use ingestors::{IngestReceipt, Reading, ReadingBody, TelemetryIngestor};
pub use providers::StatusProvider;
