//! Redis-backed [`CounterStore`], for deployments where several processes
//! share one monthly quota.
//!
//! `INCR` is atomic on the server, so concurrent increments never lose counts.
//! Admission is still check-then-act, see [`super::QuotaTracker`].

use std::time::Duration;

use redis::{AsyncCommands as _, aio::ConnectionManager};

use crate::prelude::*;

use super::store::{CounterStore, StoreError, StoreResult};

/// Counters stored in Redis.
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to Redis at `redis_url` (e.g. "redis://localhost:6379").
    pub async fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Redis connection error: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Redis connection manager error: {e}"))
        })?;
        Ok(Self { conn })
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await.map_err(unavailable)?;
        Ok(value.unwrap_or(0))
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, u64>(key, 1u64).await.map_err(unavailable)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        conn.expire::<_, ()>(key, seconds).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(unavailable)
    }
}
