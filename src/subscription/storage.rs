//! Storage trait for subscription records.
//!
//! Implement [`SubscriptionStore`] to persist records to your database.
//! An in-memory implementation is provided for tests and single-node setups.

use async_trait::async_trait;

use super::error::Result;
use super::record::{SubscriptionRecord, SubscriptionStatus};

/// Persistence for one subscription record per tenant.
///
/// The store carries no lifecycle rules. All mutations after creation go through
/// [`compare_and_save`](SubscriptionStore::compare_and_save) so that concurrent
/// writers never clobber each other.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Load the record for a tenant.
    async fn get(&self, tenant_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Create a record.
    ///
    /// Returns [`SubscriptionError::AlreadyExists`](super::error::SubscriptionError::AlreadyExists)
    /// when the tenant already has one. The stored version starts at 1.
    async fn insert(&self, record: &SubscriptionRecord) -> Result<SubscriptionRecord>;

    /// Replace `expected` with `updated` only if the stored record still has the
    /// same `version` and `status` as `expected`.
    ///
    /// Returns the saved record (with its bumped version) on success, or `None`
    /// when someone else wrote first. A SQL implementation looks like:
    ///
    /// ```sql
    /// UPDATE subscriptions SET ..., version = version + 1
    /// WHERE tenant_id = $1 AND version = $2 AND status = $3
    /// RETURNING *
    /// ```
    async fn compare_and_save(
        &self,
        expected: &SubscriptionRecord,
        updated: &SubscriptionRecord,
    ) -> Result<Option<SubscriptionRecord>>;

    /// Delete the record only if it is unchanged since `expected` was read.
    async fn delete_if_unchanged(&self, expected: &SubscriptionRecord) -> Result<bool>;

    /// List records matching a filter, ordered by tenant ID.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<SubscriptionRecord>>;
}

/// Selection criteria for [`SubscriptionStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only these stored statuses. Empty means any.
    pub statuses: Vec<SubscriptionStatus>,
    /// Only records linked to a processor subscription.
    pub with_processor_subscription: bool,
    /// Only the record linked to this processor subscription.
    pub subscription_ref: Option<String>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Match every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match records whose stored status is one of `statuses`.
    #[must_use]
    pub fn statuses(statuses: impl IntoIterator<Item = SubscriptionStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    /// The record linked to processor subscription `subscription_ref`.
    #[must_use]
    pub fn for_subscription_ref(subscription_ref: impl Into<String>) -> Self {
        Self {
            subscription_ref: Some(subscription_ref.into()),
            ..Self::default()
        }
    }

    /// Only records with a processor subscription reference.
    #[must_use]
    pub fn with_processor_subscription(mut self) -> Self {
        self.with_processor_subscription = true;
        self
    }

    /// Cap the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies this filter (ignoring `limit`).
    #[must_use]
    pub fn matches(&self, record: &SubscriptionRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && (!self.with_processor_subscription || record.has_processor_subscription())
            && self.subscription_ref.as_deref().is_none_or(|wanted| {
                record.processor_subscription_ref.as_deref() == Some(wanted)
            })
    }
}

pub use memory::InMemorySubscriptionStore;

mod memory {
    use super::*;
    use crate::subscription::error::SubscriptionError;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory subscription store.
    ///
    /// Wraps data in Arc for cheap cloning; clones share the same records.
    #[derive(Debug, Default, Clone)]
    pub struct InMemorySubscriptionStore {
        records: Arc<RwLock<BTreeMap<String, SubscriptionRecord>>>,
    }

    impl InMemorySubscriptionStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored records.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Whether the store is empty.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn get(&self, tenant_id: &str) -> Result<Option<SubscriptionRecord>> {
            Ok(self.records.read().await.get(tenant_id).cloned())
        }

        async fn insert(&self, record: &SubscriptionRecord) -> Result<SubscriptionRecord> {
            let mut records = self.records.write().await;
            if records.contains_key(&record.tenant_id) {
                return Err(SubscriptionError::AlreadyExists {
                    tenant_id: record.tenant_id.clone(),
                });
            }

            let mut stored = record.clone();
            stored.version = 1;
            records.insert(stored.tenant_id.clone(), stored.clone());
            Ok(stored)
        }

        async fn compare_and_save(
            &self,
            expected: &SubscriptionRecord,
            updated: &SubscriptionRecord,
        ) -> Result<Option<SubscriptionRecord>> {
            let mut records = self.records.write().await;

            let Some(current) = records.get_mut(&expected.tenant_id) else {
                return Ok(None);
            };
            if current.version != expected.version || current.status != expected.status {
                return Ok(None);
            }

            let mut stored = updated.clone();
            stored.tenant_id = expected.tenant_id.clone();
            stored.version = current.version + 1;
            *current = stored.clone();
            Ok(Some(stored))
        }

        async fn delete_if_unchanged(&self, expected: &SubscriptionRecord) -> Result<bool> {
            let mut records = self.records.write().await;
            match records.get(&expected.tenant_id) {
                Some(current)
                    if current.version == expected.version && current.status == expected.status =>
                {
                    records.remove(&expected.tenant_id);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn list(&self, filter: &RecordFilter) -> Result<Vec<SubscriptionRecord>> {
            let records = self.records.read().await;
            let matching = records.values().filter(|r| filter.matches(r)).cloned();
            Ok(match filter.limit {
                Some(limit) => matching.take(limit).collect(),
                None => matching.collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::error::SubscriptionError;
    use chrono::{Duration, Utc};

    fn trial(tenant_id: &str) -> SubscriptionRecord {
        SubscriptionRecord::new_trial(tenant_id, Utc::now(), Duration::days(14))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemorySubscriptionStore::new();
        assert!(store.get("tenant_1").await.unwrap().is_none());

        let saved = store.insert(&trial("tenant_1")).await.unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = InMemorySubscriptionStore::new();
        store.insert(&trial("tenant_1")).await.unwrap();

        let err = store.insert(&trial("tenant_1")).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::AlreadyExists { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_compare_and_save_detects_stale_writes() {
        let store = InMemorySubscriptionStore::new();
        let original = store.insert(&trial("tenant_1")).await.unwrap();

        let mut first = original.clone();
        first.status = SubscriptionStatus::Active;
        let saved = store.compare_and_save(&original, &first).await.unwrap().unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(saved.status, SubscriptionStatus::Active);

        // A second writer still holding the original read loses.
        let mut second = original.clone();
        second.status = SubscriptionStatus::Expired;
        assert!(store.compare_and_save(&original, &second).await.unwrap().is_none());

        let current = store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_compare_and_save_missing_record() {
        let store = InMemorySubscriptionStore::new();
        let ghost = trial("ghost");
        assert!(store.compare_and_save(&ghost, &ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_if_unchanged() {
        let store = InMemorySubscriptionStore::new();
        let original = store.insert(&trial("tenant_1")).await.unwrap();

        let mut updated = original.clone();
        updated.status = SubscriptionStatus::Expired;
        let saved = store.compare_and_save(&original, &updated).await.unwrap().unwrap();

        assert!(!store.delete_if_unchanged(&original).await.unwrap());
        assert!(store.delete_if_unchanged(&saved).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let store = InMemorySubscriptionStore::new();
        store.insert(&trial("tenant_a")).await.unwrap();

        let mut active = trial("tenant_b");
        active.status = SubscriptionStatus::Active;
        active.processor_subscription_ref = Some("sub_b".to_string());
        store.insert(&active).await.unwrap();

        let mut expired = trial("tenant_c");
        expired.status = SubscriptionStatus::Expired;
        store.insert(&expired).await.unwrap();

        let all = store.list(&RecordFilter::all()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].tenant_id, "tenant_a");

        let live = store
            .list(&RecordFilter::statuses([SubscriptionStatus::Trial, SubscriptionStatus::Active]))
            .await
            .unwrap();
        assert_eq!(live.len(), 2);

        let linked = store
            .list(&RecordFilter::all().with_processor_subscription())
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].tenant_id, "tenant_b");

        let by_ref = store.list(&RecordFilter::for_subscription_ref("sub_b")).await.unwrap();
        assert_eq!(by_ref.len(), 1);
        assert_eq!(by_ref[0].tenant_id, "tenant_b");
        assert!(
            store
                .list(&RecordFilter::for_subscription_ref("sub_x"))
                .await
                .unwrap()
                .is_empty()
        );

        let limited = store.list(&RecordFilter::all().limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
