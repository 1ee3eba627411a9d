//! Read-modify-write over a [`SubscriptionStore`] with optimistic concurrency.

use super::error::{Result, SubscriptionError};
use super::record::SubscriptionRecord;
use super::storage::SubscriptionStore;

/// Attempts before a lost race is surfaced as a conflict.
const MAX_ATTEMPTS: u32 = 2;

/// Outcome of [`conditional_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// The mutation decided nothing needed to change.
    Unchanged(SubscriptionRecord),
    /// The mutation was written.
    Saved {
        before: SubscriptionRecord,
        after: SubscriptionRecord,
    },
}

impl Update {
    /// The record as it stands after the update.
    #[must_use]
    pub fn record(&self) -> &SubscriptionRecord {
        match self {
            Self::Unchanged(record) => record,
            Self::Saved { after, .. } => after,
        }
    }

    #[must_use]
    pub fn into_record(self) -> SubscriptionRecord {
        match self {
            Self::Unchanged(record) => record,
            Self::Saved { after, .. } => after,
        }
    }

    /// Whether anything was written.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Read the tenant's record, apply `mutate`, and write the result conditionally.
///
/// `mutate` sees the freshest record on every attempt and returns `Ok(None)` when
/// no write is needed. A lost race re-reads and re-applies once; losing again
/// yields [`SubscriptionError::ConcurrencyConflict`].
pub async fn conditional_update<S, F>(store: &S, tenant_id: &str, mut mutate: F) -> Result<Update>
where
    S: SubscriptionStore + ?Sized,
    F: FnMut(&SubscriptionRecord) -> Result<Option<SubscriptionRecord>>,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let current = store
            .get(tenant_id)
            .await?
            .ok_or_else(|| SubscriptionError::NoSubscription {
                tenant_id: tenant_id.to_string(),
            })?;

        let Some(updated) = mutate(&current)? else {
            return Ok(Update::Unchanged(current));
        };

        if let Some(after) = store.compare_and_save(&current, &updated).await? {
            return Ok(Update::Saved {
                before: current,
                after,
            });
        }

        tracing::debug!(
            target: "subscription.store",
            tenant_id = %tenant_id,
            attempt,
            "Conditional write lost the race, re-reading"
        );
    }

    Err(SubscriptionError::ConcurrencyConflict {
        tenant_id: tenant_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::record::SubscriptionStatus;
    use crate::subscription::storage::{InMemorySubscriptionStore, RecordFilter};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_update_saves_mutation() {
        let store = InMemorySubscriptionStore::new();
        store
            .insert(&SubscriptionRecord::new_trial("tenant_1", Utc::now(), Duration::days(14)))
            .await
            .unwrap();

        let update = conditional_update(&store, "tenant_1", |record| {
            let mut next = record.clone();
            next.status = SubscriptionStatus::Active;
            Ok(Some(next))
        })
        .await
        .unwrap();

        assert!(update.is_saved());
        assert_eq!(update.record().status, SubscriptionStatus::Active);
        assert_eq!(update.record().version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = InMemorySubscriptionStore::new();
        let err = conditional_update(&store, "nobody", |_| Ok(None)).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NoSubscription { .. }));
    }

    /// Store that bumps the record behind the caller's back before each write.
    struct RacingStore {
        inner: InMemorySubscriptionStore,
        races_left: AtomicU32,
    }

    #[async_trait]
    impl SubscriptionStore for RacingStore {
        async fn get(&self, tenant_id: &str) -> Result<Option<SubscriptionRecord>> {
            self.inner.get(tenant_id).await
        }

        async fn insert(&self, record: &SubscriptionRecord) -> Result<SubscriptionRecord> {
            self.inner.insert(record).await
        }

        async fn compare_and_save(
            &self,
            expected: &SubscriptionRecord,
            updated: &SubscriptionRecord,
        ) -> Result<Option<SubscriptionRecord>> {
            if self.races_left.load(Ordering::SeqCst) > 0 {
                self.races_left.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.get(&expected.tenant_id).await?.unwrap();
                let mut bumped = current.clone();
                bumped.contact_email = Some("someone-else@example.com".to_string());
                self.inner.compare_and_save(&current, &bumped).await?;
            }
            self.inner.compare_and_save(expected, updated).await
        }

        async fn delete_if_unchanged(&self, expected: &SubscriptionRecord) -> Result<bool> {
            self.inner.delete_if_unchanged(expected).await
        }

        async fn list(&self, filter: &RecordFilter) -> Result<Vec<SubscriptionRecord>> {
            self.inner.list(filter).await
        }
    }

    async fn racing_store(races: u32) -> RacingStore {
        let inner = InMemorySubscriptionStore::new();
        inner
            .insert(&SubscriptionRecord::new_trial("tenant_1", Utc::now(), Duration::days(14)))
            .await
            .unwrap();
        RacingStore {
            inner,
            races_left: AtomicU32::new(races),
        }
    }

    #[tokio::test]
    async fn test_update_retries_once_after_conflict() {
        let store = racing_store(1).await;
        let mut calls = 0;

        let update = conditional_update(&store, "tenant_1", |record| {
            calls += 1;
            let mut next = record.clone();
            next.status = SubscriptionStatus::Expired;
            Ok(Some(next))
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        let saved = update.into_record();
        assert_eq!(saved.status, SubscriptionStatus::Expired);
        // The re-read picked up the concurrent writer's change.
        assert_eq!(saved.contact_email.as_deref(), Some("someone-else@example.com"));
    }

    #[tokio::test]
    async fn test_update_surfaces_second_conflict() {
        let store = racing_store(2).await;

        let err = conditional_update(&store, "tenant_1", |record| {
            let mut next = record.clone();
            next.status = SubscriptionStatus::Expired;
            Ok(Some(next))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SubscriptionError::ConcurrencyConflict { .. }));
    }
}
