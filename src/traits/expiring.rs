//! Key-value storage with per-entry TTL
//!
//! Used for short-lived state such as impersonation sessions. Backends may keep
//! expired entries around for a while; callers that care about exact expiry
//! check their own timestamps on read.

use crate::subscription::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Expiring key-value store
///
/// Values are opaque bytes so the trait stays object-safe; callers serialize
/// with `serde_json`.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Get a value
    ///
    /// Returns `Ok(None)` if the key doesn't exist or the backend already dropped it.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, replacing any existing one, to expire after `ttl`
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if the backend is healthy
    fn is_healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S: ExpiringStore + ?Sized> ExpiringStore for std::sync::Arc<S> {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get_bytes(key).await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        (**self).set_bytes(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}
