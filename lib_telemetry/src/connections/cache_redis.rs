//! # Redis Ephemeral Store
//!
//! Implementation of [`EphemeralStore`] for deployments that keep their
//! ephemeral state outside the gateway process. Uses the async multiplexed
//! `ConnectionManager`, which reconnects on its own after a dropped link.
//!
//! Multi-step operations are sent as a single `MULTI`/`EXEC` pipeline so no
//! other client can interleave between the steps:
//!
//! | Operation | Commands |
//! |---|---|
//! | `set_if_absent` | `SET key value NX PX ttl` |
//! | `append_and_count` | `ZADD`, `ZREMRANGEBYSCORE -inf (now - longest)`, one `ZCOUNT` per window, `PEXPIRE` |
//! | `count_windows` | one `ZCOUNT` per window |
//! | `push` | `RPUSH`, `PEXPIRE` |
//! | `drain_list` | `LRANGE 0 -1`, `DEL` |
//!
//! Window scores are wall-clock milliseconds, so every node sharing a server
//! should keep its clock synchronised.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::info;

use super::EphemeralStore;
use crate::error::Result;

/// Handle to a Redis server. Cheap to clone.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Opens a managed connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to redis at {}", url);
        Ok(Self { conn })
    }

    /// Round-trips a `PING`, for health checks.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    // PX/PEXPIRE reject zero.
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Score at or below which an entry is at least `window` old.
fn cutoff(now_ms: i64, window: Duration) -> i64 {
    now_ms.saturating_sub(i64::try_from(millis(window)).unwrap_or(i64::MAX))
}

/// Exclusive lower score bound of the entries younger than `window`.
fn live_from(now_ms: i64, window: Duration) -> String {
    format!("({}", cutoff(now_ms, window))
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // Nil reply when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
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
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(token)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff(now_ms, longest))
            .ignore();
        for window in windows {
            pipe.cmd("ZCOUNT").arg(key).arg(live_from(now_ms, *window)).arg("+inf");
        }
        pipe.cmd("PEXPIRE").arg(key).arg(millis(longest)).ignore();

        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(counts)
    }

    async fn count_windows(&self, key: &str, windows: &[Duration]) -> Result<Vec<u64>> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for window in windows {
            pipe.cmd("ZCOUNT").arg(key).arg(live_from(now_ms, *window)).arg("+inf");
        }
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(counts)
    }

    async fn push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (len,): (u64,) = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn drain_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }
}
