//! # Utilities Module
//!
//! Small, dependency-light helpers shared by the rest of the crate that do not
//! belong to any single component.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Wall-clock helpers for retry-after boundaries.
pub mod time;

pub use time::{seconds_until, start_of_next_minute};
