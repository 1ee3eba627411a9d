//! In-memory expiring store backed by moka
//!
//! Entries carry their own TTL. Moka drops them lazily during maintenance, which
//! matches the "checked on read, never swept" contract of [`ExpiringStore`].

use crate::subscription::error::Result;
use crate::traits::expiring::ExpiringStore;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::time::{Duration, Instant};

/// Default maximum number of entries
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    ttl: Duration,
}

/// Per-entry TTL that is reset on overwrite and untouched by reads
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &Entry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-memory [`ExpiringStore`]
///
/// Suitable for a single node. Use a shared backend when running several
/// instances behind a load balancer, otherwise an impersonation started on one
/// node cannot be ended on another.
#[derive(Clone)]
pub struct InMemoryExpiringStore {
    inner: MokaCache<String, Entry>,
}

impl InMemoryExpiringStore {
    /// Create a store holding at most `max_entries` values
    pub fn new(max_entries: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self { inner }
    }

    /// Run pending maintenance (expiration, eviction)
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Approximate number of entries
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for InMemoryExpiringStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl ExpiringStore for InMemoryExpiringStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.inner.insert(key.to_string(), Entry { value, ttl }).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryExpiringStore::new(100);
        store
            .set_bytes("impersonation:u1", b"admin".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get_bytes("impersonation:u1").await.unwrap(),
            Some(b"admin".to_vec())
        );

        store.delete("impersonation:u1").await.unwrap();
        assert_eq!(store.get_bytes("impersonation:u1").await.unwrap(), None);

        // Deleting again is fine.
        store.delete("impersonation:u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let store = InMemoryExpiringStore::default();
        store.set_bytes("k", b"first".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set_bytes("k", b"second".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get_bytes("k").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = InMemoryExpiringStore::new(100);
        store
            .set_bytes("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.run_pending_tasks().await;

        assert_eq!(store.get_bytes("k").await.unwrap(), None);
    }
}
