//! # Core Engine Module
//!
//! The fan-out pipeline of the telemetry gateway. Updates enter through the
//! rate limiter, wait in the aggregator, and leave through the scheduler and
//! the dispatcher.
//!
//! ## Core Components:
//!
//! - **`rate_limiter`**: dual sliding-window admission control per device.
//!
//! - **`aggregator`**: per-subscriber pending batch with an atomic drain.
//!
//! - **`scheduler`**: per-subscriber debounce. At most one flush is pending
//!   for a subscriber at any time, enforced with a self-expiring marker.
//!
//! - **`registry`**: live connections indexed by id, subscriber and topic.
//!
//! - **`dispatcher`**: the `PubSubFanout` seam and its zero-copy
//!   implementation over the registry.
//!
//! - **`pipeline`**: `FanoutCore`, the assembled set of components.
//!
//! All shared mutable state goes through the injected `EphemeralStore`.
//! Connections and publishing are local to the process. When several gateway
//! instances share one Redis, rate windows are shared while batches and
//! markers are scoped by `FanoutConfig::instance_id`, so each instance only
//! flushes what it buffered itself. Delivery across instances is not
//! provided: a subscriber's devices and sockets must reach the same instance.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-subscriber pending batches.
pub mod aggregator;
/// Topic-addressed publishing of server messages.
pub mod dispatcher;
/// Wiring of all components around one store.
pub mod pipeline;
/// Per-origin dual-window admission control.
pub mod rate_limiter;
/// Live transport connections and their topics.
pub mod registry;
/// Debounced per-subscriber broadcasts.
pub mod scheduler;

// --- Public API Re-exports ---
pub use aggregator::BatchAggregator;
pub use dispatcher::{Dispatcher, PubSubFanout};
pub use pipeline::FanoutCore;
pub use rate_limiter::{Admission, RateLimiter, WindowCounts};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, RegistryStats};
pub use scheduler::{BroadcastScheduler, FlushOutcome, SchedulerSnapshot, SchedulerStats};
