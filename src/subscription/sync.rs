//! Reconciliation of local records with the payment processor.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;

use super::error::{Result, SubscriptionError};
use super::gateway::{PaymentGateway, RemoteSubscription};
use super::notify::NotificationScheduler;
use super::record::{SubscriptionRecord, SubscriptionStatus, validate_tenant_id};
use super::retry::{RetryPolicy, with_retry};
use super::storage::{RecordFilter, SubscriptionStore};
use super::update::{Update, conditional_update};
use crate::audit::{AuditLogger, LifecycleAuditEvent};
use crate::clock::Clock;

/// Sync settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum processor calls in flight during a batch.
    pub pool_size: usize,
    /// Records not synced for this long are picked up by [`PaymentSyncService::sync_stale`].
    pub stale_after: Duration,
    /// Maximum records per stale sync run.
    pub batch_limit: usize,
    /// Timeout and retry for each processor call.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            stale_after: Duration::hours(1),
            batch_limit: 50,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of syncing one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub tenant_id: String,
    pub status: SubscriptionStatus,
    pub status_changed: bool,
    /// Notices handed to the mailer as a consequence of this sync.
    pub notifications_triggered: usize,
}

/// One tenant that could not be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub tenant_id: String,
    pub error: SubscriptionError,
}

/// Outcome of a batch sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Tenants synced successfully.
    pub succeeded: usize,
    /// Of those, tenants whose status changed.
    pub changed: usize,
    pub failed: Vec<SyncFailure>,
}

impl BatchReport {
    /// Total tenants attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

/// Brings local subscription records in line with the processor.
#[derive(Clone)]
pub struct PaymentSyncService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    notices: NotificationScheduler,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl PaymentSyncService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        notices: NotificationScheduler,
        audit: Arc<dyn AuditLogger>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notices,
            audit,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch the tenant's processor subscription and apply the minimal local
    /// change that makes the record agree with it.
    ///
    /// The whole change, including the welcome marker, lands in one
    /// conditional write, so the record is never half-updated.
    pub async fn sync(&self, tenant_id: &str) -> Result<SyncResult> {
        validate_tenant_id(tenant_id)?;

        let record = self
            .store
            .get(tenant_id)
            .await?
            .ok_or_else(|| SubscriptionError::NoSubscription {
                tenant_id: tenant_id.to_string(),
            })?;
        let subscription_ref = record
            .processor_subscription_ref
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SubscriptionError::NoProcessorSubscription {
                tenant_id: tenant_id.to_string(),
            })?;

        let remote = with_retry(&self.config.retry, "retrieve", || {
            self.gateway.retrieve(&subscription_ref)
        })
        .await?;

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |current| {
            Ok(Some(reconcile(current, &remote, now)))
        })
        .await?;

        let (before, after) = match update {
            Update::Saved { before, after } => (before, after),
            Update::Unchanged(record) => (record.clone(), record),
        };

        let status_changed = before.status != after.status;
        if status_changed {
            tracing::info!(
                target: "subscription.sync",
                tenant_id = %tenant_id,
                from = %before.status,
                to = %after.status,
                remote_status = %remote.status,
                "Local status reconciled with processor"
            );
            self.audit
                .log(LifecycleAuditEvent::StatusSynced {
                    tenant_id: tenant_id.to_string(),
                    from: before.status,
                    to: after.status,
                })
                .await;
        } else {
            tracing::debug!(
                target: "subscription.sync",
                tenant_id = %tenant_id,
                status = %after.status,
                "Record already in agreement with processor"
            );
        }

        let mut notifications_triggered = 0;
        if before.welcome_email_sent_at.is_none() && after.welcome_email_sent_at.is_some() {
            notifications_triggered += 1;
            self.notices.send_welcome(&after, now).await;
        }

        Ok(SyncResult {
            tenant_id: tenant_id.to_string(),
            status: after.status,
            status_changed,
            notifications_triggered,
        })
    }

    /// Attach a processor subscription to the tenant's record, then sync it.
    ///
    /// Called once checkout completes. Linking the reference already on the
    /// record is a plain sync; a different reference replaces it.
    pub async fn link(&self, tenant_id: &str, subscription_ref: &str) -> Result<SyncResult> {
        validate_tenant_id(tenant_id)?;
        let subscription_ref = subscription_ref.trim();
        if subscription_ref.is_empty() {
            return Err(SubscriptionError::InvalidArgument {
                message: "processor subscription reference is required".to_string(),
            });
        }

        let update = conditional_update(self.store.as_ref(), tenant_id, |current| {
            if current.processor_subscription_ref.as_deref() == Some(subscription_ref) {
                return Ok(None);
            }
            let mut next = current.clone();
            next.processor_subscription_ref = Some(subscription_ref.to_string());
            Ok(Some(next))
        })
        .await?;

        if let Update::Saved { before, .. } = &update {
            tracing::info!(
                target: "subscription.sync",
                tenant_id = %tenant_id,
                subscription_ref = %subscription_ref,
                replaced = before.processor_subscription_ref.is_some(),
                "Processor subscription linked"
            );
            self.audit
                .log(LifecycleAuditEvent::SubscriptionLinked {
                    tenant_id: tenant_id.to_string(),
                    subscription_ref: subscription_ref.to_string(),
                })
                .await;
        }

        self.sync(tenant_id).await
    }

    /// Sync many tenants with bounded concurrency.
    ///
    /// Each tenant is retried and fails on its own; the batch never fails as a whole.
    pub async fn sync_all(&self, tenant_ids: Vec<String>) -> BatchReport {
        let pool_size = self.config.pool_size.max(1);
        let tasks: Vec<_> = tenant_ids
            .into_iter()
            .map(|tenant_id| self.sync_tagged(tenant_id))
            .collect();
        let results: Vec<(String, Result<SyncResult>)> =
            stream::iter(tasks).buffer_unordered(pool_size).collect().await;

        let mut report = BatchReport::default();
        for (tenant_id, result) in results {
            match result {
                Ok(result) => {
                    report.succeeded += 1;
                    if result.status_changed {
                        report.changed += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target: "subscription.sync",
                        tenant_id = %tenant_id,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Tenant sync failed"
                    );
                    report.failed.push(SyncFailure { tenant_id, error });
                }
            }
        }
        report.failed.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        tracing::info!(
            target: "subscription.sync",
            succeeded = report.succeeded,
            changed = report.changed,
            failed = report.failed.len(),
            "Batch sync complete"
        );
        report
    }

    async fn sync_tagged(&self, tenant_id: String) -> (String, Result<SyncResult>) {
        let result = self.sync(&tenant_id).await;
        (tenant_id, result)
    }

    /// Sync every record linked to a processor subscription.
    pub async fn sync_all_known(&self) -> Result<BatchReport> {
        let ids = self
            .store
            .list(&RecordFilter::all().with_processor_subscription())
            .await?
            .into_iter()
            .map(|r| r.tenant_id)
            .collect();
        Ok(self.sync_all(ids).await)
    }

    /// Sync live records that have not been synced recently.
    pub async fn sync_stale(&self) -> Result<BatchReport> {
        let now = self.clock.now();
        let cutoff = now - self.config.stale_after;

        let ids: Vec<String> = self
            .store
            .list(
                &RecordFilter::statuses([
                    SubscriptionStatus::Active,
                    SubscriptionStatus::Trial,
                    SubscriptionStatus::PastDue,
                ])
                .with_processor_subscription(),
            )
            .await?
            .into_iter()
            .filter(|r| r.last_synced_at.is_none_or(|at| at < cutoff))
            .take(self.config.batch_limit)
            .map(|r| r.tenant_id)
            .collect();

        if ids.is_empty() {
            tracing::debug!(target: "subscription.sync", "No stale records to sync");
            return Ok(BatchReport::default());
        }
        Ok(self.sync_all(ids).await)
    }
}

/// The record after applying the processor's view at `now`.
fn reconcile(record: &SubscriptionRecord, remote: &RemoteSubscription, now: DateTime<Utc>) -> SubscriptionRecord {
    let mut next = record.clone();

    if let Some(status) = remote.local_status(now) {
        next.status = status;
    }
    if let Some(period_end) = remote.current_period_end {
        next.ends_at = Some(period_end);
    } else if next.status.is_expired() && record.status != next.status {
        next.ends_at = Some(now);
    }
    if let Some(trial_end) = remote.trial_end {
        next.trial_ends_at = Some(next.trial_ends_at.map_or(trial_end, |t| t.max(trial_end)));
    }
    if let Some(customer) = remote.customer_id.as_ref().filter(|c| !c.is_empty()) {
        next.processor_customer_ref = Some(customer.clone());
    }

    if next.status == SubscriptionStatus::Active
        && record.status != SubscriptionStatus::Active
        && record.welcome_email_sent_at.is_none()
    {
        next.welcome_email_sent_at = Some(now);
    }

    next.last_synced_at = Some(now);
    next.updated_at = now;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::test::RecordingAuditLogger;
    use crate::clock::ManualClock;
    use crate::subscription::gateway::RemoteStatus;
    use crate::subscription::gateway::test::MockPaymentGateway;
    use crate::subscription::notify::NotificationConfig;
    use crate::subscription::storage::InMemorySubscriptionStore;
    use crate::traits::mailer::test::RecordingMailer;

    struct Harness {
        store: InMemorySubscriptionStore,
        gateway: MockPaymentGateway,
        mailer: RecordingMailer,
        audit: RecordingAuditLogger,
        clock: ManualClock,
        service: PaymentSyncService,
    }

    fn harness() -> Harness {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let mailer = RecordingMailer::new();
        let audit = RecordingAuditLogger::new();
        let clock = ManualClock::default();
        let notices = NotificationScheduler::new(
            Arc::new(store.clone()),
            Arc::new(mailer.clone()),
            NotificationConfig::default(),
        );
        let config = SyncConfig {
            retry: RetryPolicy::new().max_retries(2).base_delay_ms(1),
            ..SyncConfig::default()
        };
        let service = PaymentSyncService::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            notices,
            Arc::new(audit.clone()),
            Arc::new(clock.clone()),
            config,
        );
        Harness {
            store,
            gateway,
            mailer,
            audit,
            clock,
            service,
        }
    }

    fn remote(id: &str, status: RemoteStatus, period_end: DateTime<Utc>) -> RemoteSubscription {
        RemoteSubscription {
            id: id.to_string(),
            customer_id: Some(format!("cus_{}", id)),
            status,
            current_period_end: Some(period_end),
            trial_end: None,
            cancel_at_period_end: false,
        }
    }

    async fn linked_trial(h: &Harness, tenant_id: &str) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_trial(tenant_id, h.clock.now(), Duration::days(14))
            .with_contact_email(format!("{}@example.com", tenant_id));
        record.processor_subscription_ref = Some(format!("sub_{}", tenant_id));
        h.store.insert(&record).await.unwrap()
    }

    #[tokio::test]
    async fn test_sync_activates_and_welcomes_once() {
        let h = harness();
        linked_trial(&h, "tenant_1").await;
        let period_end = h.clock.now() + Duration::days(30);
        h.gateway
            .add_subscription(remote("sub_tenant_1", RemoteStatus::Active, period_end));

        let first = h.service.sync("tenant_1").await.unwrap();
        assert!(first.status_changed);
        assert_eq!(first.status, SubscriptionStatus::Active);
        assert_eq!(first.notifications_triggered, 1);

        let second = h.service.sync("tenant_1").await.unwrap();
        assert!(!second.status_changed);
        assert_eq!(second.notifications_triggered, 0);

        assert_eq!(h.mailer.sent_matching("subscription is active").len(), 1);
        let stored = h.store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(stored.ends_at, Some(period_end));
        assert_eq!(stored.processor_customer_ref.as_deref(), Some("cus_sub_tenant_1"));
        assert_eq!(stored.last_synced_at, Some(h.clock.now()));
        assert_eq!(h.audit.kinds().await, vec!["status_synced"]);
    }

    #[tokio::test]
    async fn test_link_attaches_reference_and_syncs() {
        let h = harness();
        let record = SubscriptionRecord::new_trial("tenant_1", h.clock.now(), Duration::days(14));
        h.store.insert(&record).await.unwrap();
        h.gateway.add_subscription(remote(
            "sub_new",
            RemoteStatus::Active,
            h.clock.now() + Duration::days(30),
        ));

        let result = h.service.link("tenant_1", "sub_new").await.unwrap();
        assert_eq!(result.status, SubscriptionStatus::Active);

        let stored = h.store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(stored.processor_subscription_ref.as_deref(), Some("sub_new"));

        let err = h.service.link("tenant_1", "  ").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_sync_maps_failed_charge_to_past_due() {
        let h = harness();
        linked_trial(&h, "tenant_1").await;
        let now = h.clock.now();
        h.gateway
            .add_subscription(remote("sub_tenant_1", RemoteStatus::Active, now + Duration::days(30)));
        h.service.sync("tenant_1").await.unwrap();

        h.gateway
            .add_subscription(remote("sub_tenant_1", RemoteStatus::PastDue, now));
        let result = h.service.sync("tenant_1").await.unwrap();
        assert_eq!(result.status, SubscriptionStatus::PastDue);

        // Recovery goes back to active without a second welcome.
        h.gateway
            .add_subscription(remote("sub_tenant_1", RemoteStatus::Active, now + Duration::days(30)));
        let result = h.service.sync("tenant_1").await.unwrap();
        assert_eq!(result.status, SubscriptionStatus::Active);
        assert_eq!(result.notifications_triggered, 0);
    }

    #[tokio::test]
    async fn test_sync_keeps_trial_end_moving_forward() {
        let h = harness();
        let record = linked_trial(&h, "tenant_1").await;
        let original_end = record.trial_ends_at.unwrap();

        let mut sub = remote("sub_tenant_1", RemoteStatus::Trialing, original_end);
        sub.trial_end = Some(original_end - Duration::days(5));
        h.gateway.add_subscription(sub.clone());
        h.service.sync("tenant_1").await.unwrap();
        let stored = h.store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(stored.trial_ends_at, Some(original_end));

        sub.trial_end = Some(original_end + Duration::days(5));
        h.gateway.add_subscription(sub);
        h.service.sync("tenant_1").await.unwrap();
        let stored = h.store.get("tenant_1").await.unwrap().unwrap();
        assert_eq!(stored.trial_ends_at, Some(original_end + Duration::days(5)));
    }

    #[tokio::test]
    async fn test_incomplete_leaves_status_alone() {
        let h = harness();
        linked_trial(&h, "tenant_1").await;
        h.gateway.add_subscription(remote(
            "sub_tenant_1",
            RemoteStatus::Incomplete,
            h.clock.now() + Duration::days(30),
        ));

        let result = h.service.sync("tenant_1").await.unwrap();
        assert!(!result.status_changed);
        assert_eq!(result.status, SubscriptionStatus::Trial);
    }

    #[tokio::test]
    async fn test_sync_requires_processor_link() {
        let h = harness();
        h.store
            .insert(&SubscriptionRecord::new_trial("tenant_1", h.clock.now(), Duration::days(14)))
            .await
            .unwrap();

        let err = h.service.sync("tenant_1").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NoProcessorSubscription { .. }));

        let err = h.service.sync("missing").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NoSubscription { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_retries_transient_failures() {
        let h = harness();
        linked_trial(&h, "tenant_1").await;
        h.gateway.add_subscription(remote(
            "sub_tenant_1",
            RemoteStatus::Active,
            h.clock.now() + Duration::days(30),
        ));
        h.gateway.fail_next(
            "sub_tenant_1",
            SubscriptionError::from_http_status("retrieve", 503, "unavailable"),
            2,
        );

        let result = h.service.sync("tenant_1").await.unwrap();
        assert_eq!(result.status, SubscriptionStatus::Active);
        assert_eq!(h.gateway.calls("retrieve"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness();
        linked_trial(&h, "tenant_1").await;

        let err = h.service.sync("tenant_1").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(h.gateway.calls("retrieve"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_all_isolates_failures() {
        let h = harness();
        let period_end = h.clock.now() + Duration::days(30);
        let mut ids = Vec::new();
        for i in 0..6 {
            let tenant_id = format!("tenant_{}", i);
            linked_trial(&h, &tenant_id).await;
            h.gateway.add_subscription(remote(
                &format!("sub_{}", tenant_id),
                RemoteStatus::Active,
                period_end,
            ));
            ids.push(tenant_id);
        }
        h.gateway.fail_next(
            "sub_tenant_2",
            SubscriptionError::transient("retrieve", "connection reset"),
            u32::MAX,
        );

        let report = h.service.sync_all(ids).await;
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.changed, 5);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tenant_id, "tenant_2");
        assert_eq!(report.total(), 6);
    }

    #[tokio::test]
    async fn test_sync_stale_picks_unsynced_live_records() {
        let h = harness();
        let period_end = h.clock.now() + Duration::days(30);
        for tenant_id in ["fresh", "stale", "never"] {
            linked_trial(&h, tenant_id).await;
            h.gateway.add_subscription(remote(
                &format!("sub_{}", tenant_id),
                RemoteStatus::Trialing,
                period_end,
            ));
        }
        h.service.sync("stale").await.unwrap();
        h.clock.advance(Duration::hours(2));
        h.service.sync("fresh").await.unwrap();

        let before = h.gateway.calls("retrieve");
        let report = h.service.sync_stale().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(h.gateway.calls("retrieve") - before, 2);
    }
}
