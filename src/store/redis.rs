//! Redis-backed counter backend.
//!
//! Speaks plain cache commands (`GET`, `SET .. EX`, `SETNX`+`EXPIRE`, `MGET`,
//! `DEL`, `KEYS prefix*`) against any Redis-protocol-compatible service. The
//! one compound operation, increment-with-expiry, runs as a Lua script so the
//! count and its TTL are applied atomically on the server.

use super::{CounterBackend, StoreError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::fmt;
use std::time::Duration;

/// INCR the key, applying the TTL only on the first hit of a fresh key.
const INCR_WITH_TTL: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Counter backend over a multiplexed async Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    incr_script: redis::Script,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Create a backend for `url` (e.g. `redis://localhost:6379`).
    ///
    /// The connection itself is established lazily per operation; a dead
    /// service shows up as `StoreError::Unavailable` on use, where the
    /// [`CounterStore`](super::CounterStore) facade absorbs it.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, incr_script: redis::Script::new(INCR_WITH_TTL) })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let set: bool = conn.set_nx(key, value).await?;
        if set {
            let _: () = conn.expire(key, ttl_secs(ttl) as i64).await?;
        }
        Ok(set)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let count: i64 = self
            .incr_script
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        // MGET with a single key still answers with an array via the raw
        // command, unlike the typed `mget` helper.
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}
