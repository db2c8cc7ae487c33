//! # In-Memory Ephemeral Store
//!
//! Single-instance implementation of [`EphemeralStore`] on top of `DashMap`.
//! Each operation runs under the shard lock of its own key (through the entry
//! API), which makes every multi-step operation atomic per key without a
//! global lock.
//!
//! Time is read from `tokio::time::Instant`, so tests running on a paused
//! runtime can move windows and expiries forward with `tokio::time::advance`.
//! Expired keys are treated as absent on access and reclaimed by
//! [`MemoryStore::purge_expired`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::EphemeralStore;
use crate::error::{FanoutError, Result};

enum SlotValue {
    Text(String),
    List(Vec<String>),
    /// Admission events, oldest first.
    Window(VecDeque<(Instant, String)>),
}

struct Slot {
    value: SlotValue,
    expires_at: Option<Instant>,
}

impl Slot {
    fn text(value: &str, expires_at: Option<Instant>) -> Self {
        Self {
            value: SlotValue::Text(value.to_string()),
            expires_at,
        }
    }

    fn list() -> Self {
        Self {
            value: SlotValue::List(Vec::new()),
            expires_at: None,
        }
    }

    fn window() -> Self {
        Self {
            value: SlotValue::Window(VecDeque::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

fn wrong_type(key: &str) -> FanoutError {
    FanoutError::BackingStoreUnavailable(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Expiry instant of a key written at `now`. A TTL past the clock's range
/// leaves the key without expiry.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Drops events that fell out of the window. Events are kept in time order,
/// so pruning stops at the first live one.
fn prune(events: &mut VecDeque<(Instant, String)>, now: Instant, window: Duration) {
    while let Some((ts, _)) = events.front() {
        if now.saturating_duration_since(*ts) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}

/// Number of events younger than each window.
fn count_live(events: &VecDeque<(Instant, String)>, now: Instant, windows: &[Duration]) -> Vec<u64> {
    windows
        .iter()
        .map(|window| {
            let first_live =
                events.partition_point(|(ts, _)| now.saturating_duration_since(*ts) >= *window);
            (events.len() - first_live) as u64
        })
        .collect()
}

/// Lock-free (sharded) in-process store.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes every expired key and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if slot.is_expired(Instant::now()) {
            return Ok(None);
        }
        match &slot.value {
            SlotValue::Text(value) => Ok(Some(value.clone())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| deadline(now, ttl));
        self.slots.insert(key.to_string(), Slot::text(value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.slots.remove(key) {
            Some((_, slot)) => Ok(!slot.is_expired(Instant::now())),
            None => Ok(false),
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let now = Instant::now();
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::text(value, deadline(now, ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::text(value, deadline(Instant::now(), ttl)));
                Ok(true)
            }
        }
    }

    async fn append_and_count(
        &self,
        key: &str,
        token: &str,
        windows: &[Duration],
    ) -> Result<Vec<u64>> {
        let Some(longest) = windows.iter().max().copied() else {
            return Ok(Vec::new());
        };
        let mut entry = self.slots.entry(key.to_string()).or_insert_with(Slot::window);
        // Read the clock under the shard lock so events stay time-ordered.
        let now = Instant::now();
        let slot = &mut *entry;
        if slot.is_expired(now) {
            *slot = Slot::window();
        }

        let SlotValue::Window(events) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        events.push_back((now, token.to_string()));
        prune(events, now, longest);
        let counts = count_live(events, now, windows);
        slot.expires_at = deadline(now, longest);
        Ok(counts)
    }

    async fn count_windows(&self, key: &str, windows: &[Duration]) -> Result<Vec<u64>> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(vec![0; windows.len()]);
        };
        let now = Instant::now();
        if slot.is_expired(now) {
            return Ok(vec![0; windows.len()]);
        }
        match &slot.value {
            SlotValue::Window(events) => Ok(count_live(events, now, windows)),
            _ => Err(wrong_type(key)),
        }
    }

    async fn push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64> {
        let mut entry = self.slots.entry(key.to_string()).or_insert_with(Slot::list);
        let now = Instant::now();
        let slot = &mut *entry;
        if slot.is_expired(now) {
            *slot = Slot::list();
        }

        let SlotValue::List(items) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        items.push(value.to_string());
        let len = items.len() as u64;
        slot.expires_at = deadline(now, ttl);
        Ok(len)
    }

    async fn drain_list(&self, key: &str) -> Result<Vec<String>> {
        let removed = self
            .slots
            .remove_if(key, |_, slot| matches!(slot.value, SlotValue::List(_)));

        match removed {
            Some((_, slot)) if !slot.is_expired(Instant::now()) => match slot.value {
                SlotValue::List(items) => Ok(items),
                _ => Ok(Vec::new()),
            },
            Some(_) => Ok(Vec::new()),
            None if self.slots.contains_key(key) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }
}
