//! Operator-triggered and tenant-triggered mutations.
//!
//! Every mutation goes through a conditional write on the freshly read record.
//! Cancellation additionally holds an in-process guard per tenant so that a
//! double-submitted request never reaches the processor twice.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;

use super::error::{Result, SubscriptionError};
use super::gateway::{CheckoutRequest, PaymentGateway, SubscriptionUpdate, idempotency_key};
use super::notify::NotificationScheduler;
use super::record::{SubscriptionRecord, SubscriptionStatus, validate_tenant_id};
use super::resolver::StatusResolver;
use super::retry::{RetryPolicy, with_retry};
use super::storage::{RecordFilter, SubscriptionStore};
use super::update::{Update, conditional_update};
use crate::audit::{AuditLogger, LifecycleAuditEvent};
use crate::clock::Clock;
use crate::traits::auth::AuthContext;

/// Upper bound for a single trial extension.
const MAX_TRIAL_EXTENSION_DAYS: u32 = 365;

pub const CANCELLED_MESSAGE: &str = "Your subscription has been cancelled. You will continue to \
    have access until the end of your current billing period.";
pub const ALREADY_CANCELLED_MESSAGE: &str = "Your subscription is already cancelled.";
pub const CANCEL_IN_PROGRESS_MESSAGE: &str =
    "A cancellation for this subscription is already in progress.";
pub const TRIAL_CANCELLED_MESSAGE: &str =
    "Trial cancelled successfully. You can reactivate anytime by subscribing.";

// ============================================================================
// Configuration
// ============================================================================

/// Where the processor sends tenants back to after checkout or the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnUrls {
    pub checkout_success: String,
    pub checkout_cancel: String,
    pub portal_return: String,
}

impl ReturnUrls {
    /// URLs under the subscription page of `base_url`.
    #[must_use]
    pub fn for_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            checkout_success: format!("{}/dashboard/subscription/?success=1", base),
            checkout_cancel: format!("{}/dashboard/subscription/?cancelled=1", base),
            portal_return: format!("{}/dashboard/subscription/", base),
        }
    }
}

impl Default for ReturnUrls {
    fn default() -> Self {
        Self::for_base_url("http://localhost:8000")
    }
}

/// Settings for administrative operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConfig {
    /// Length of a new trial.
    pub trial_length: Duration,
    /// Days added by the `extend_trials` bulk action.
    pub bulk_trial_extension_days: u32,
    /// Records whose access ended longer ago than this are removed by `cleanup_expired`.
    pub expired_retention: Duration,
    /// Timeout and retry for processor calls.
    pub retry: RetryPolicy,
    pub return_urls: ReturnUrls,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            trial_length: Duration::days(14),
            bulk_trial_extension_days: 7,
            expired_retention: Duration::days(30),
            retry: RetryPolicy::default(),
            return_urls: ReturnUrls::default(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// A bulk action over many records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkActionKind {
    /// Extend every live trial.
    ExtendTrials,
    /// Remind active tenants whose period ends soon.
    SendRenewalReminders,
    /// Delete long-expired records.
    CleanupExpired,
}

impl BulkActionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtendTrials => "extend_trials",
            Self::SendRenewalReminders => "send_renewal_reminders",
            Self::CleanupExpired => "cleanup_expired",
        }
    }
}

impl std::fmt::Display for BulkActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BulkActionKind {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extend_trials" => Ok(Self::ExtendTrials),
            "send_renewal_reminders" => Ok(Self::SendRenewalReminders),
            "cleanup_expired" => Ok(Self::CleanupExpired),
            other => Err(SubscriptionError::InvalidBulkAction {
                kind: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkActionResult {
    pub kind: BulkActionKind,
    pub count: usize,
}

/// How a cancellation request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Cancellation scheduled with the processor and recorded locally.
    Cancelled { access_until: Option<DateTime<Utc>> },
    /// Someone already cancelled it.
    AlreadyCancelled,
    /// Another request for the same tenant is still running.
    InProgress,
}

/// Result of [`AdminOperations::cancel_subscription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub ok: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: CancelOutcome,
}

impl From<CancelOutcome> for CancelResult {
    fn from(outcome: CancelOutcome) -> Self {
        let message = match outcome {
            CancelOutcome::Cancelled { .. } => CANCELLED_MESSAGE,
            CancelOutcome::AlreadyCancelled => ALREADY_CANCELLED_MESSAGE,
            CancelOutcome::InProgress => CANCEL_IN_PROGRESS_MESSAGE,
        };
        Self {
            ok: true,
            message: message.to_string(),
            outcome,
        }
    }
}

/// Removes a tenant from the in-flight set when the cancellation finishes.
struct InFlight<'a> {
    set: &'a DashSet<String>,
    tenant_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.tenant_id);
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Mutations performed outside the normal processor-driven lifecycle.
#[derive(Clone)]
pub struct AdminOperations {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    notices: NotificationScheduler,
    audit: Arc<dyn AuditLogger>,
    resolver: StatusResolver,
    clock: Arc<dyn Clock>,
    config: AdminConfig,
    cancelling: Arc<DashSet<String>>,
}

impl AdminOperations {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        notices: NotificationScheduler,
        audit: Arc<dyn AuditLogger>,
        resolver: StatusResolver,
        clock: Arc<dyn Clock>,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notices,
            audit,
            resolver,
            clock,
            config,
            cancelling: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    /// Start a trial for a newly registered tenant.
    pub async fn create_trial(&self, tenant_id: &str, contact_email: Option<String>) -> Result<SubscriptionRecord> {
        validate_tenant_id(tenant_id)?;

        let now = self.clock.now();
        let mut record = SubscriptionRecord::new_trial(tenant_id, now, self.config.trial_length);
        record.contact_email = contact_email.filter(|e| !e.trim().is_empty());
        let saved = self.store.insert(&record).await?;

        tracing::info!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            trial_ends_at = ?saved.trial_ends_at,
            "Trial created"
        );
        if let Some(trial_ends_at) = saved.trial_ends_at {
            self.audit
                .log(LifecycleAuditEvent::TrialCreated {
                    tenant_id: tenant_id.to_string(),
                    trial_ends_at,
                })
                .await;
        }
        Ok(saved)
    }

    /// End a trial early at the tenant's request and send the trial-expired notice.
    ///
    /// A trial whose end date already passed counts as expired even if the
    /// stored status still says `trial`.
    pub async fn cancel_trial(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<SubscriptionRecord> {
        require_operator_or_owner(actor, tenant_id, "cancel this trial")?;
        validate_tenant_id(tenant_id)?;

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            self.require_live_trial(record, now, "cancel the trial")?;
            let mut next = record.clone();
            next.status = SubscriptionStatus::ExpiredTrial;
            next.ends_at = Some(now);
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        tracing::info!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            actor = %actor.user_id(),
            "Trial cancelled"
        );
        self.audit
            .log(LifecycleAuditEvent::TrialCancelled {
                tenant_id: tenant_id.to_string(),
                actor: actor.user_id().to_string(),
            })
            .await;

        if let Err(e) = self.notices.notify_trial_expired(tenant_id, now).await {
            tracing::warn!(
                target: "subscription.admin",
                tenant_id = %tenant_id,
                error = %e,
                "Skipping trial-expired notice"
            );
        }
        Ok(update.into_record())
    }

    /// Add `days` to a trial's end. Only valid while the trial is still running.
    pub async fn extend_trial(
        &self,
        actor: &dyn AuthContext,
        tenant_id: &str,
        days: u32,
    ) -> Result<SubscriptionRecord> {
        require_operator(actor, "extend trials")?;
        validate_tenant_id(tenant_id)?;
        if days == 0 || days > MAX_TRIAL_EXTENSION_DAYS {
            return Err(SubscriptionError::InvalidArgument {
                message: format!("days must be between 1 and {}", MAX_TRIAL_EXTENSION_DAYS),
            });
        }

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            self.require_live_trial(record, now, "extend the trial")?;
            Ok(Some(extended(record, days, now)))
        })
        .await?;
        let record = update.into_record();

        tracing::info!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            actor = %actor.user_id(),
            days,
            trial_ends_at = ?record.trial_ends_at,
            "Trial extended"
        );
        if let Some(trial_ends_at) = record.trial_ends_at {
            self.audit
                .log(LifecycleAuditEvent::TrialExtended {
                    tenant_id: tenant_id.to_string(),
                    actor: actor.user_id().to_string(),
                    days,
                    trial_ends_at,
                })
                .await;
        }
        Ok(record)
    }

    /// Revoke access immediately. The processor is not contacted.
    ///
    /// The processor subscription is detached from the record so that later
    /// syncs and webhooks for it cannot bring the tenant back to `active`.
    /// The customer reference is kept for checkout and the billing portal;
    /// a new checkout links a new subscription.
    pub async fn force_expire(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<SubscriptionRecord> {
        require_operator(actor, "force expire subscriptions")?;
        validate_tenant_id(tenant_id)?;

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            let mut next = record.clone();
            next.status = SubscriptionStatus::Expired;
            next.ends_at = Some(now);
            next.processor_subscription_ref = None;
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        let (previous, detached) = match &update {
            Update::Saved { before, .. } => (before.status, before.processor_subscription_ref.clone()),
            Update::Unchanged(record) => (record.status, None),
        };
        tracing::info!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            actor = %actor.user_id(),
            previous = %previous,
            detached_subscription = ?detached,
            "Subscription force expired"
        );
        self.audit
            .log(LifecycleAuditEvent::ForceExpired {
                tenant_id: tenant_id.to_string(),
                actor: actor.user_id().to_string(),
                previous,
            })
            .await;
        Ok(update.into_record())
    }

    /// Mark the record active locally.
    ///
    /// The processor is not contacted, so the next sync may move the record
    /// back to whatever the processor reports. A first entry into `active`
    /// writes the welcome marker with the status and sends the welcome notice.
    pub async fn reactivate(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<SubscriptionRecord> {
        require_operator(actor, "reactivate subscriptions")?;
        validate_tenant_id(tenant_id)?;

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            if record.status == SubscriptionStatus::Active {
                return Ok(None);
            }
            let mut next = record.clone();
            next.status = SubscriptionStatus::Active;
            next.welcome_email_sent_at = record.welcome_email_sent_at.or(Some(now));
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        let (before, after) = match update {
            Update::Saved { before, after } => (before, after),
            Update::Unchanged(record) => return Ok(record),
        };

        tracing::warn!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            actor = %actor.user_id(),
            previous = %before.status,
            has_processor_subscription = after.has_processor_subscription(),
            "Subscription reactivated locally without processor contact; local and processor state may disagree"
        );
        self.audit
            .log(LifecycleAuditEvent::Reactivated {
                tenant_id: tenant_id.to_string(),
                actor: actor.user_id().to_string(),
                previous: before.status,
            })
            .await;

        if before.welcome_email_sent_at.is_none() {
            self.notices.send_welcome(&after, now).await;
        }
        Ok(after)
    }

    /// Cancel at period end.
    ///
    /// The processor is told first; the local record only becomes `cancelled`
    /// once the processor accepted. A second request while one is running, or
    /// after the record is already cancelled, is a benign no-op.
    pub async fn cancel_subscription(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<CancelResult> {
        require_operator_or_owner(actor, tenant_id, "cancel this subscription")?;
        validate_tenant_id(tenant_id)?;

        if !self.cancelling.insert(tenant_id.to_string()) {
            tracing::info!(
                target: "subscription.admin",
                tenant_id = %tenant_id,
                "Cancellation already in progress"
            );
            return Ok(CancelOutcome::InProgress.into());
        }
        let _guard = InFlight {
            set: &self.cancelling,
            tenant_id: tenant_id.to_string(),
        };

        let record = self
            .store
            .get(tenant_id)
            .await?
            .ok_or_else(|| SubscriptionError::NoSubscription {
                tenant_id: tenant_id.to_string(),
            })?;
        match record.status {
            SubscriptionStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled.into()),
            SubscriptionStatus::Active => {}
            status => return Err(invalid_transition(&record, status, "cancel the subscription")),
        }
        let subscription_ref = record
            .processor_subscription_ref
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SubscriptionError::NoProcessorSubscription {
                tenant_id: tenant_id.to_string(),
            })?;

        // One key for every attempt, so a retry after a lost response is a no-op.
        let update_request = SubscriptionUpdate::new()
            .cancel_at_period_end(true)
            .idempotency_key(idempotency_key("cancel_at_period_end"));
        let remote = with_retry(&self.config.retry, "cancel_at_period_end", || {
            self.gateway.update(&subscription_ref, &update_request)
        })
        .await
        .inspect_err(|e| {
            tracing::error!(
                target: "subscription.admin",
                tenant_id = %tenant_id,
                error = %e,
                "Processor rejected cancellation; local record left unchanged"
            );
        })?;

        let now = self.clock.now();
        let update = conditional_update(self.store.as_ref(), tenant_id, |current| {
            if current.status != SubscriptionStatus::Active {
                return Ok(None);
            }
            let mut next = current.clone();
            next.status = SubscriptionStatus::Cancelled;
            next.ends_at = remote.current_period_end.or(current.ends_at);
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        let Update::Saved { after, .. } = update else {
            return Ok(CancelOutcome::AlreadyCancelled.into());
        };

        tracing::info!(
            target: "subscription.admin",
            tenant_id = %tenant_id,
            actor = %actor.user_id(),
            access_until = ?after.ends_at,
            "Subscription cancelled at period end"
        );
        self.audit
            .log(LifecycleAuditEvent::SubscriptionCancelled {
                tenant_id: tenant_id.to_string(),
                actor: actor.user_id().to_string(),
                access_until: after.ends_at,
            })
            .await;

        Ok(CancelOutcome::Cancelled {
            access_until: after.ends_at,
        }
        .into())
    }

    /// Run a bulk action and report how many records it touched.
    pub async fn bulk_action(&self, actor: &dyn AuthContext, kind: BulkActionKind) -> Result<BulkActionResult> {
        require_operator(actor, "run bulk actions")?;

        let now = self.clock.now();
        let count = match kind {
            BulkActionKind::ExtendTrials => self.extend_live_trials(now).await?,
            BulkActionKind::SendRenewalReminders => self.notices.renewal_reminders(now).await?,
            BulkActionKind::CleanupExpired => self.cleanup_expired(now).await?,
        };

        tracing::info!(
            target: "subscription.admin",
            actor = %actor.user_id(),
            kind = %kind,
            count,
            "Bulk action complete"
        );
        self.audit
            .log(LifecycleAuditEvent::BulkActionRun {
                actor: actor.user_id().to_string(),
                kind: kind.as_str().to_string(),
                count,
            })
            .await;

        Ok(BulkActionResult { kind, count })
    }

    /// Hosted checkout URL for a tenant.
    pub async fn create_checkout_url(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<String> {
        require_operator_or_owner(actor, tenant_id, "start checkout for this tenant")?;
        validate_tenant_id(tenant_id)?;

        let record = self.store.get(tenant_id).await?;
        let request = CheckoutRequest {
            tenant_id: tenant_id.to_string(),
            customer_ref: record.as_ref().and_then(|r| r.processor_customer_ref.clone()),
            contact_email: record.as_ref().and_then(|r| r.contact_email.clone()),
            success_url: self.config.return_urls.checkout_success.clone(),
            cancel_url: self.config.return_urls.checkout_cancel.clone(),
            idempotency_key: Some(idempotency_key("create_checkout_session")),
        };

        let url = with_retry(&self.config.retry, "create_checkout_session", || {
            self.gateway.create_checkout_session(&request)
        })
        .await?;

        tracing::info!(target: "subscription.admin", tenant_id = %tenant_id, "Checkout session created");
        Ok(url)
    }

    /// Customer portal URL for a tenant with a processor customer.
    pub async fn create_portal_url(&self, actor: &dyn AuthContext, tenant_id: &str) -> Result<String> {
        require_operator_or_owner(actor, tenant_id, "open the billing portal for this tenant")?;
        validate_tenant_id(tenant_id)?;

        let record = self
            .store
            .get(tenant_id)
            .await?
            .ok_or_else(|| SubscriptionError::NoSubscription {
                tenant_id: tenant_id.to_string(),
            })?;
        let customer_ref = record
            .processor_customer_ref
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SubscriptionError::NoProcessorSubscription {
                tenant_id: tenant_id.to_string(),
            })?;

        let return_url = &self.config.return_urls.portal_return;
        let url = with_retry(&self.config.retry, "create_portal_session", || {
            self.gateway.create_portal_session(&customer_ref, return_url)
        })
        .await?;

        tracing::info!(target: "subscription.admin", tenant_id = %tenant_id, "Portal session created");
        Ok(url)
    }

    async fn extend_live_trials(&self, now: DateTime<Utc>) -> Result<usize> {
        let days = self.config.bulk_trial_extension_days;
        let candidates: Vec<SubscriptionRecord> = self
            .store
            .list(&RecordFilter::statuses([SubscriptionStatus::Trial]))
            .await?
            .into_iter()
            .filter(|r| is_live_trial(r, now))
            .collect();

        let mut extended_count = 0;
        for candidate in &candidates {
            let result = conditional_update(self.store.as_ref(), &candidate.tenant_id, |record| {
                if !is_live_trial(record, now) {
                    return Ok(None);
                }
                Ok(Some(extended(record, days, now)))
            })
            .await;

            match result {
                Ok(update) if update.is_saved() => extended_count += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    target: "subscription.admin",
                    tenant_id = %candidate.tenant_id,
                    error = %e,
                    "Could not extend trial"
                ),
            }
        }
        Ok(extended_count)
    }

    /// Delete records whose access ended before the retention cut-off.
    ///
    /// Selection uses the effective status, so a cancelled or past-due record
    /// that lapsed without ever being persisted as `expired` is included.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.expired_retention;
        let candidates = self
            .store
            .list(&RecordFilter::statuses([
                SubscriptionStatus::Expired,
                SubscriptionStatus::Cancelled,
                SubscriptionStatus::PastDue,
            ]))
            .await?;

        let mut removed = 0;
        for candidate in candidates.iter().filter(|r| self.purgeable(r, now, cutoff)) {
            // Decide again on a fresh read; the list may be stale.
            let Some(record) = self.store.get(&candidate.tenant_id).await? else {
                continue;
            };
            if !self.purgeable(&record, now, cutoff) {
                continue;
            }
            if self.store.delete_if_unchanged(&record).await? {
                removed += 1;
                self.audit
                    .log(LifecycleAuditEvent::RecordPurged {
                        tenant_id: record.tenant_id.clone(),
                    })
                    .await;
            }
        }
        Ok(removed)
    }

    /// Whether `record` is expired at `now` with access ending before `cutoff`.
    fn purgeable(&self, record: &SubscriptionRecord, now: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
        if self.resolver.resolve(record, now) != SubscriptionStatus::Expired {
            return false;
        }
        let access_ended = match record.ends_at {
            Some(_) => self
                .resolver
                .apply(record, now)
                .map_or(record.ends_at, |next| next.ends_at),
            None => Some(record.updated_at),
        };
        access_ended.is_some_and(|ends| ends < cutoff)
    }

    /// Reject unless `record` is a trial that is still running at `now`.
    fn require_live_trial(&self, record: &SubscriptionRecord, now: DateTime<Utc>, operation: &str) -> Result<()> {
        match self.resolver.resolve(record, now) {
            SubscriptionStatus::Trial => Ok(()),
            effective => Err(invalid_transition(record, effective, operation)),
        }
    }
}

fn is_live_trial(record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
    record.status == SubscriptionStatus::Trial && record.trial_ends_at.is_some_and(|ends| ends > now)
}

fn extended(record: &SubscriptionRecord, days: u32, now: DateTime<Utc>) -> SubscriptionRecord {
    let mut next = record.clone();
    let base = record.trial_ends_at.unwrap_or(now);
    next.trial_ends_at = Some(base + Duration::days(i64::from(days)));
    next.updated_at = now;
    next
}

fn invalid_transition(record: &SubscriptionRecord, status: SubscriptionStatus, operation: &str) -> SubscriptionError {
    SubscriptionError::InvalidTransition {
        tenant_id: record.tenant_id.clone(),
        status,
        operation: operation.to_string(),
    }
}

fn require_operator(actor: &dyn AuthContext, action: &str) -> Result<()> {
    if actor.is_operator() {
        Ok(())
    } else {
        tracing::warn!(
            target: "subscription.admin",
            user_id = %actor.user_id(),
            action = action,
            "Permission denied"
        );
        Err(SubscriptionError::PermissionDenied {
            action: action.to_string(),
        })
    }
}

fn require_operator_or_owner(actor: &dyn AuthContext, tenant_id: &str, action: &str) -> Result<()> {
    if actor.is_operator() || actor.acts_for(tenant_id) {
        Ok(())
    } else {
        require_operator(actor, action)
    }
}
