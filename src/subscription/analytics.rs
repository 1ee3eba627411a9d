//! Subscription analytics and the health report.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::error::Result;
use super::gateway::{PaymentGateway, PriceInfo};
use super::record::{SubscriptionRecord, SubscriptionStatus};
use super::resolver::StatusResolver;
use super::storage::{RecordFilter, SubscriptionStore};
use crate::clock::Clock;

/// Conversion below this percentage raises a warning.
const LOW_CONVERSION_PERCENT: f64 = 20.0;
/// Churn above this percentage raises a warning.
const HIGH_CHURN_PERCENT: f64 = 10.0;

/// Counts per effective status plus derived rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionAnalytics {
    pub total: usize,
    pub trial: usize,
    pub active: usize,
    pub past_due: usize,
    pub cancelled: usize,
    pub expired_trial: usize,
    pub expired: usize,
    /// Percentage of trialling tenants that became paying: `active / (trial + active + expired_trial)`.
    pub conversion_rate: f64,
    /// Percentage of paying tenants lost: `(cancelled + expired + expired_trial) / (active + cancelled + expired)`.
    pub churn_rate: f64,
    /// Monthly recurring revenue in major currency units. Zero unless the price is billed monthly.
    pub mrr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl SubscriptionAnalytics {
    /// Compute analytics over `records`, classifying each by its effective status at `now`.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a SubscriptionRecord>,
        resolver: &StatusResolver,
        now: DateTime<Utc>,
    ) -> Self {
        let mut analytics = Self::default();
        for record in records {
            analytics.total += 1;
            match resolver.resolve(record, now) {
                SubscriptionStatus::Trial => analytics.trial += 1,
                SubscriptionStatus::Active => analytics.active += 1,
                SubscriptionStatus::PastDue => analytics.past_due += 1,
                SubscriptionStatus::Cancelled => analytics.cancelled += 1,
                SubscriptionStatus::ExpiredTrial => analytics.expired_trial += 1,
                SubscriptionStatus::Expired => analytics.expired += 1,
            }
        }

        analytics.conversion_rate = percentage(
            analytics.active,
            analytics.trial + analytics.active + analytics.expired_trial,
        );
        analytics.churn_rate = percentage(
            analytics.cancelled + analytics.expired + analytics.expired_trial,
            analytics.active + analytics.cancelled + analytics.expired,
        );
        analytics
    }

    /// Fill in MRR as `active * monthly amount` for a monthly price.
    #[must_use]
    pub fn with_price(mut self, price: Option<&PriceInfo>) -> Self {
        let Some(price) = price else {
            return self;
        };
        if let Some(monthly) = price.monthly_amount_minor() {
            let revenue = self.active as f64 * monthly as f64 / 100.0;
            self.mrr = (revenue * 100.0).round() / 100.0;
            self.currency = Some(price.currency.clone());
        }
        self
    }
}

/// Percentage rounded to two decimals; zero for an empty denominator.
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let raw = part as f64 / whole as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Operational health of the subscription system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub processor_configured: bool,
    /// Problems that make the system unable to take payments.
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Linked records not synced within the staleness window.
    pub stale_records: usize,
    pub analytics: SubscriptionAnalytics,
}

/// Read-only reporting over the store.
#[derive(Clone)]
pub struct AnalyticsService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    resolver: StatusResolver,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl AnalyticsService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        resolver: StatusResolver,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            resolver,
            clock,
            stale_after,
        }
    }

    pub async fn analytics(&self) -> Result<SubscriptionAnalytics> {
        let records = self.store.list(&RecordFilter::all()).await?;
        let price = self.price().await;
        Ok(SubscriptionAnalytics::from_records(&records, &self.resolver, self.clock.now())
            .with_price(price.as_ref()))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let records = self.store.list(&RecordFilter::all()).await?;
        let price = self.price().await;
        let analytics =
            SubscriptionAnalytics::from_records(&records, &self.resolver, now).with_price(price.as_ref());

        let cutoff = now - self.stale_after;
        let stale_records = records
            .iter()
            .filter(|r| r.has_processor_subscription())
            .filter(|r| r.last_synced_at.is_none_or(|at| at < cutoff))
            .count();

        let processor_configured = self.gateway.is_configured();
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !processor_configured {
            issues.push("No payment processor is configured. Tenants cannot subscribe.".to_string());
        }
        if analytics.conversion_rate < LOW_CONVERSION_PERCENT {
            warnings.push(format!(
                "Low conversion rate ({}%). Consider improving onboarding.",
                analytics.conversion_rate
            ));
        }
        if analytics.churn_rate > HIGH_CHURN_PERCENT {
            warnings.push(format!(
                "High churn rate ({}%). Review customer satisfaction.",
                analytics.churn_rate
            ));
        }
        if stale_records > 0 {
            warnings.push(format!(
                "{} subscriptions haven't been synced in {}+ hours.",
                stale_records,
                self.stale_after.num_hours()
            ));
        }

        let status = if !issues.is_empty() {
            HealthStatus::Critical
        } else if !warnings.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        if status != HealthStatus::Healthy {
            tracing::warn!(
                target: "subscription.health",
                status = ?status,
                issues = issues.len(),
                warnings = warnings.len(),
                "Subscription system health degraded"
            );
        }

        Ok(HealthReport {
            status,
            processor_configured,
            issues,
            warnings,
            stale_records,
            analytics,
        })
    }

    /// The checkout price, or `None` when there is no processor or it cannot be read.
    async fn price(&self) -> Option<PriceInfo> {
        if !self.gateway.is_configured() {
            return None;
        }
        match self.gateway.price().await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!(
                    target: "subscription.health",
                    error = %e,
                    "Could not load pricing; reporting MRR as zero"
                );
                None
            }
        }
    }
}
