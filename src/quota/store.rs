//! Counter storage for the monthly quota.
//!
//! The quota tracker only needs a handful of atomic operations on integer
//! counters keyed by string, with per-key expiry. Anything that offers those
//! (an in-process map, a JSON file, Redis) can back it.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::prelude::*;

/// Errors reported by a [`CounterStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or read.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store was reachable, but its contents made no sense.
    #[error("counter store data is corrupt: {0}")]
    Corrupt(String),
}

/// Result type for [`CounterStore`] operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Atomic counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Read a counter. Missing or expired keys read as 0.
    async fn get(&self, key: &str) -> StoreResult<u64>;

    /// Increment a counter by one and return the new value.
    async fn incr(&self, key: &str) -> StoreResult<u64>;

    /// Expire a counter `ttl` from now.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Overwrite a counter. Used by operators to seed or reset usage.
    async fn set(&self, key: &str, value: u64) -> StoreResult<()>;
}

/// A counter value and its optional deadline.
#[derive(Clone, Copy, Debug)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// An in-process [`CounterStore`].
///
/// Counters vanish when the process exits, so this is mostly useful for tests
/// and for long-running hosts that embed the pipeline.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_owned()))
    }

    /// Look up a live entry, dropping it if it has expired.
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<u64> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, key, Instant::now())
            .map(|entry| entry.value)
            .unwrap_or(0))
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        if let Some(entry) = Self::live_entry(&mut entries, key, now) {
            entry.value += 1;
            return Ok(entry.value);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: 1,
                expires_at: None,
            },
        );
        Ok(1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        if let Some(entry) = Self::live_entry(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn set(&self, key: &str, value: u64) -> StoreResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_reads_as_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_counts_up_from_one() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), 2);
        assert_eq!(store.get("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_keys_restart() {
        let store = MemoryCounterStore::new();
        store.set("k", 41).await.unwrap();
        store.expire("k", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 0);
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_keeps_value_until_deadline() {
        let store = MemoryCounterStore::new();
        store.incr("k").await.unwrap();
        store.expire("k", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 1);
    }
}
