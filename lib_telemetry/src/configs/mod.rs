//! # Configuration Modules
//!
//! Tunables of the fan-out core. Server-level settings (ports, log
//! directories, TLS) live with the binaries; this module only carries what the
//! library itself needs to run.

/// Rate windows, debounce timing and store key layout.
pub mod config_fanout;

pub use config_fanout::{FanoutConfig, KeySpace};
