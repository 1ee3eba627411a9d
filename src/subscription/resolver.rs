//! Effective status resolution.
//!
//! The persisted status only caches the last resolution. Time-based transitions
//! are always re-derived here from the record's timestamps and the current instant:
//!
//! | Stored        | Becomes         | When                                   |
//! |---------------|-----------------|----------------------------------------|
//! | `trial`       | `expired_trial` | `now >= trial_ends_at`                 |
//! | `past_due`    | `expired`       | `now >= ends_at + grace_window`        |
//! | `cancelled`   | `expired`       | `now >= ends_at` (or no `ends_at`)     |
//!
//! Processor-driven transitions (trial to active, active to past_due, recovery)
//! are applied by the sync service, and administrative ones by admin operations.

use chrono::{DateTime, Duration, Utc};

use super::error::Result;
use super::record::{SubscriptionRecord, SubscriptionStatus};
use super::storage::SubscriptionStore;
use super::update::{Update, conditional_update};

/// Default grace window between a failed charge at period end and loss of access.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::days(2);

/// Pure state machine over subscription records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResolver {
    grace_window: Duration,
}

impl Default for StatusResolver {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_WINDOW)
    }
}

/// Result of [`StatusResolver::resolve_and_persist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The record after resolution.
    pub record: SubscriptionRecord,
    /// The stored status this call moved away from, if it persisted a transition.
    pub previous: Option<SubscriptionStatus>,
}

impl Resolution {
    /// `(from, to)` when this call persisted a transition.
    #[must_use]
    pub fn transition(&self) -> Option<(SubscriptionStatus, SubscriptionStatus)> {
        self.previous.map(|from| (from, self.record.status))
    }
}

impl StatusResolver {
    #[must_use]
    pub fn new(grace_window: Duration) -> Self {
        Self { grace_window }
    }

    #[must_use]
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Derive the effective status of `record` at `now`. Never touches storage.
    #[must_use]
    pub fn resolve(&self, record: &SubscriptionRecord, now: DateTime<Utc>) -> SubscriptionStatus {
        match record.status {
            SubscriptionStatus::Trial => match record.trial_ends_at {
                Some(ends) if now >= ends => SubscriptionStatus::ExpiredTrial,
                _ => SubscriptionStatus::Trial,
            },
            SubscriptionStatus::PastDue => match record.ends_at {
                Some(ends) if now >= ends + self.grace_window => SubscriptionStatus::Expired,
                _ => SubscriptionStatus::PastDue,
            },
            SubscriptionStatus::Cancelled => match record.ends_at {
                Some(ends) if now < ends => SubscriptionStatus::Cancelled,
                _ => SubscriptionStatus::Expired,
            },
            other => other,
        }
    }

    /// Whether the tenant behind `record` may use protected surfaces at `now`.
    #[must_use]
    pub fn is_allowed(&self, record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
        match self.resolve(record, now) {
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue => {
                true
            }
            SubscriptionStatus::Cancelled => record.ends_at.is_some_and(|ends| ends > now),
            SubscriptionStatus::ExpiredTrial | SubscriptionStatus::Expired => false,
        }
    }

    /// The record as it should be stored at `now`, or `None` if it is already current.
    ///
    /// For newly expired records `ends_at` is moved to the moment access was cut off.
    #[must_use]
    pub fn apply(&self, record: &SubscriptionRecord, now: DateTime<Utc>) -> Option<SubscriptionRecord> {
        let effective = self.resolve(record, now);
        if effective == record.status {
            return None;
        }

        let mut next = record.clone();
        next.status = effective;
        next.updated_at = now;
        next.ends_at = match (record.status, effective) {
            (SubscriptionStatus::Trial, SubscriptionStatus::ExpiredTrial) => {
                record.trial_ends_at.or(Some(now))
            }
            (SubscriptionStatus::PastDue, SubscriptionStatus::Expired) => {
                record.ends_at.map(|ends| ends + self.grace_window)
            }
            _ => record.ends_at.or(Some(now)),
        };
        Some(next)
    }

    /// Resolve the stored record and lazily write back a changed status.
    ///
    /// The write is conditional on the record being unchanged since it was read,
    /// so a concurrent administrative write is never clobbered; a lost race
    /// re-reads and resolves the fresh record instead.
    pub async fn resolve_and_persist<S>(
        &self,
        store: &S,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution>
    where
        S: SubscriptionStore + ?Sized,
    {
        let update = conditional_update(store, tenant_id, |record| Ok(self.apply(record, now))).await?;

        Ok(match update {
            Update::Unchanged(record) => Resolution {
                record,
                previous: None,
            },
            Update::Saved { before, after } => {
                tracing::info!(
                    target: "subscription.lifecycle",
                    tenant_id = %tenant_id,
                    from = %before.status,
                    to = %after.status,
                    "Persisted time-based status transition"
                );
                Resolution {
                    record: after,
                    previous: Some(before.status),
                }
            }
        })
    }
}
