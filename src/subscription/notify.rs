//! At-most-once lifecycle notices.
//!
//! Each notice has an idempotency marker on the record. The marker is written
//! with a conditional write *before* the mailer is called, so a crash or a
//! concurrent run can lose a notice but never send it twice.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::error::Result;
use super::record::{SubscriptionRecord, SubscriptionStatus};
use super::resolver::StatusResolver;
use super::storage::{RecordFilter, SubscriptionStore};
use super::update::{Update, conditional_update};
use crate::traits::mailer::{Email, Mailer};

/// Default lookahead for renewal reminders.
pub const DEFAULT_RENEWAL_LOOKAHEAD: Duration = Duration::days(3);

/// The notices the scheduler can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// First entry into `active`.
    Welcome,
    /// First entry into `expired_trial`.
    TrialExpired,
    /// `active` with the period end inside the lookahead.
    RenewalReminder,
}

impl Notice {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::TrialExpired => "trial_expired",
            Self::RenewalReminder => "renewal_reminder",
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// How far ahead of the period end a renewal reminder goes out.
    pub renewal_lookahead: Duration,
    /// Absolute URL of the subscription page, linked from every notice.
    pub subscription_page_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            renewal_lookahead: DEFAULT_RENEWAL_LOOKAHEAD,
            subscription_page_url: "http://localhost:8000/dashboard/subscription/".to_string(),
        }
    }
}

/// Counts from [`NotificationScheduler::daily_checks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyReport {
    /// Trials whose expiry was persisted by this run.
    pub trials_expired: usize,
    pub trial_expired_notices: usize,
    pub renewal_reminders: usize,
}

/// Sends lifecycle notices and keeps their markers.
#[derive(Clone)]
pub struct NotificationScheduler {
    store: Arc<dyn SubscriptionStore>,
    mailer: Arc<dyn Mailer>,
    config: NotificationConfig,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        mailer: Arc<dyn Mailer>,
        config: NotificationConfig,
    ) -> Self {
        Self { store, mailer, config }
    }

    #[must_use]
    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Whether a renewal reminder is due for `record` at `now`.
    ///
    /// Once per billing period: a reminder already sent inside the current
    /// lookahead window blocks another one.
    #[must_use]
    pub fn renewal_reminder_due(&self, record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
        if record.status != SubscriptionStatus::Active {
            return false;
        }
        let Some(ends_at) = record.ends_at else {
            return false;
        };
        if ends_at <= now || ends_at > now + self.config.renewal_lookahead {
            return false;
        }
        let window_start = ends_at - self.config.renewal_lookahead;
        record.last_reminded_at.is_none_or(|at| at < window_start)
    }

    /// Send the welcome notice for a record whose marker the caller already wrote.
    pub async fn send_welcome(&self, record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
        self.deliver(Notice::Welcome, record, now).await
    }

    /// Send the trial-expired notice once, if the record is an expired trial.
    ///
    /// Returns whether a notice was handed to the mailer.
    pub async fn notify_trial_expired(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            if record.status != SubscriptionStatus::ExpiredTrial
                || record.trial_expired_notified_at.is_some()
            {
                return Ok(None);
            }
            let mut next = record.clone();
            next.trial_expired_notified_at = Some(now);
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        match update {
            Update::Saved { after, .. } => Ok(self.deliver(Notice::TrialExpired, &after, now).await),
            Update::Unchanged(_) => Ok(false),
        }
    }

    /// Send a renewal reminder once per billing period, if one is due.
    pub async fn send_renewal_reminder(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let update = conditional_update(self.store.as_ref(), tenant_id, |record| {
            if !self.renewal_reminder_due(record, now) {
                return Ok(None);
            }
            let mut next = record.clone();
            next.last_reminded_at = Some(now);
            next.updated_at = now;
            Ok(Some(next))
        })
        .await?;

        match update {
            Update::Saved { after, .. } => {
                Ok(self.deliver(Notice::RenewalReminder, &after, now).await)
            }
            Update::Unchanged(_) => Ok(false),
        }
    }

    /// Send every due renewal reminder. Returns the number sent.
    pub async fn renewal_reminders(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self
            .store
            .list(&RecordFilter::statuses([SubscriptionStatus::Active]))
            .await?;

        let mut sent = 0;
        for record in candidates.iter().filter(|r| self.renewal_reminder_due(r, now)) {
            match self.send_renewal_reminder(&record.tenant_id, now).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    target: "subscription.notify",
                    tenant_id = %record.tenant_id,
                    error = %e,
                    "Skipping renewal reminder"
                ),
            }
        }
        Ok(sent)
    }

    /// Persist lapsed trials and notify every expired trial not yet told,
    /// then send due renewal reminders.
    ///
    /// There is no lookback window: a trial that lapsed while the worker was
    /// down is still picked up, and the marker keeps the notice at most once.
    pub async fn daily_checks(&self, resolver: &StatusResolver, now: DateTime<Utc>) -> Result<DailyReport> {
        let mut report = DailyReport::default();

        let pending: Vec<SubscriptionRecord> = self
            .store
            .list(&RecordFilter::statuses([
                SubscriptionStatus::Trial,
                SubscriptionStatus::ExpiredTrial,
            ]))
            .await?
            .into_iter()
            .filter(|r| {
                resolver.resolve(r, now) == SubscriptionStatus::ExpiredTrial
                    && r.trial_expired_notified_at.is_none()
            })
            .collect();

        for record in &pending {
            let tenant_id = record.tenant_id.as_str();
            if record.status == SubscriptionStatus::Trial {
                match resolver.resolve_and_persist(self.store.as_ref(), tenant_id, now).await {
                    Ok(resolution) if resolution.previous.is_some() => report.trials_expired += 1,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            target: "subscription.notify",
                            tenant_id = %tenant_id,
                            error = %e,
                            "Could not persist lapsed trial"
                        );
                        continue;
                    }
                }
            }

            match self.notify_trial_expired(tenant_id, now).await {
                Ok(true) => report.trial_expired_notices += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    target: "subscription.notify",
                    tenant_id = %tenant_id,
                    error = %e,
                    "Skipping trial-expired notice"
                ),
            }
        }

        report.renewal_reminders = self.renewal_reminders(now).await?;

        tracing::info!(
            target: "subscription.notify",
            trials_expired = report.trials_expired,
            trial_expired_notices = report.trial_expired_notices,
            renewal_reminders = report.renewal_reminders,
            "Daily lifecycle checks complete"
        );
        Ok(report)
    }

    /// Hand a notice to the mailer. Failures are logged, never retried.
    async fn deliver(&self, notice: Notice, record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
        let Some(email) = self.render(notice, record, now) else {
            tracing::info!(
                target: "subscription.notify",
                tenant_id = %record.tenant_id,
                notice = notice.as_str(),
                "No contact address on record, notice skipped"
            );
            return false;
        };

        match self.mailer.send(&email).await {
            Ok(()) => {
                tracing::info!(
                    target: "subscription.notify",
                    tenant_id = %record.tenant_id,
                    notice = notice.as_str(),
                    "Notice sent"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    target: "subscription.notify",
                    tenant_id = %record.tenant_id,
                    notice = notice.as_str(),
                    error = %e,
                    "Notice delivery failed"
                );
                false
            }
        }
    }

    fn render(&self, notice: Notice, record: &SubscriptionRecord, now: DateTime<Utc>) -> Option<Email> {
        let to = record.contact_email.as_deref().filter(|e| !e.is_empty())?;
        let url = &self.config.subscription_page_url;

        let (subject, body) = match notice {
            Notice::Welcome => (
                "Your subscription is active".to_string(),
                format!(
                    "Thanks for subscribing. Your account now has full access.\n\n\
                     Manage your subscription at any time: {}",
                    url
                ),
            ),
            Notice::TrialExpired => (
                "Your free trial has ended".to_string(),
                format!(
                    "Your free trial has ended and your dashboard and booking forms are paused.\n\n\
                     Subscribe to pick up where you left off: {}",
                    url
                ),
            ),
            Notice::RenewalReminder => {
                let days = record.days_until_next_payment(now);
                let subject = match days {
                    0 => "Your subscription renews today".to_string(),
                    1 => "Your subscription renews tomorrow".to_string(),
                    n => format!("Your subscription renews in {} days", n),
                };
                let body = match record.ends_at {
                    Some(ends) => format!(
                        "Your next payment is due on {}.\n\nReview your plan: {}",
                        ends.format("%B %-d, %Y"),
                        url
                    ),
                    None => format!("Your next payment is due soon.\n\nReview your plan: {}", url),
                };
                (subject, body)
            }
        };

        Some(Email::new(to, subject, body))
    }
}
