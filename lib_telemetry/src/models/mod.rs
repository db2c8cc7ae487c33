//! # Data Model
//!
//! Typed records that flow through the fan-out core: identifiers and topics,
//! the three kinds of buffered updates, the per-subscriber `PendingBatch`, and
//! the consolidated payload built from it at flush time.

/// Identifier newtypes and the `Topic` naming scheme.
pub mod ids;
/// Consolidated payload and client-facing messages.
pub mod payload;
/// Buffered updates and the pending batch.
pub mod updates;

pub use ids::{DeviceId, SensorId, SubscriberId, Topic};
pub use payload::{
    ConsolidatedPayload, ConsolidatedUpdates, DataPoint, DeviceStatusEntry, SensorSeries,
    ServerMessage,
};
pub use updates::{
    BatchEntry, BatchUpdate, DashboardUpdate, DeviceStatusUpdate, PendingBatch, SensorUpdate,
    StatusSnapshot,
};
