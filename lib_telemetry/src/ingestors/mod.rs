//! # Data Ingestors Module
//!
//! The front door for device telemetry. An ingestor validates a reading,
//! meters its origin through the rate limiter, buffers it for the owning
//! subscriber and makes sure a broadcast is scheduled.
//!
//! ## Contained Modules:
//! - **`telemetry`**: the `Reading` wire type and the `TelemetryIngestor`
//!   pipeline (admit, add, notify).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Reading validation and the admit/add/notify pipeline.
pub mod telemetry;

pub use telemetry::{IngestReceipt, Reading, ReadingBody, TelemetryIngestor};
