//! # Connections Module
//!
//! The ephemeral key-value layer that holds all short-lived shared state of
//! the fan-out core: rate windows, pending batches and schedule markers.
//!
//! Components never talk to a backend directly. They hold an
//! `Arc<dyn EphemeralStore>` so a deployment can run entirely in memory or
//! against a Redis server. Every multi-step operation on the trait is atomic with
//! respect to other callers on the same key; callers never wrap store calls in
//! their own locks.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// In-process store backed by a sharded concurrent map.
pub mod cache_memory;

/// Shared store backed by Redis.
#[cfg(feature = "connections")]
pub mod cache_redis;

pub use cache_memory::MemoryStore;
#[cfg(feature = "connections")]
pub use cache_redis::RedisStore;

/// Key-value storage with per-key expiry and the atomic primitives the core
/// is built on.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Reads a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a plain value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Removes a key of any kind. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomic test-and-set: writes `value` with `ttl` only if `key` is absent
    /// (or expired). Returns `true` when this caller created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically appends `token` at the current time to the event log at
    /// `key`, drops entries older than the longest of `windows`, refreshes the
    /// key's expiry to that window, and returns for each window the number of
    /// entries younger than it.
    ///
    /// All windows are read from the same log in the same step, so concurrent
    /// callers always see counts that match some serial order.
    async fn append_and_count(
        &self,
        key: &str,
        token: &str,
        windows: &[Duration],
    ) -> Result<Vec<u64>>;

    /// For each window, the number of entries of the log at `key` younger
    /// than it.
    async fn count_windows(&self, key: &str, windows: &[Duration]) -> Result<Vec<u64>>;

    /// Atomically appends `value` to the list at `key` and sets the list to
    /// expire after `ttl`. Returns the list length after the push.
    async fn push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64>;

    /// Atomically reads the whole list at `key` and removes it. A push racing
    /// with the drain lands either in the returned values or in a fresh list,
    /// never both and never neither.
    async fn drain_list(&self, key: &str) -> Result<Vec<String>>;
}
