//! The subscription record and its status enum.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, SubscriptionError};

/// Maximum accepted tenant ID length.
const MAX_TENANT_ID_LENGTH: usize = 128;

/// Lifecycle status of a tenant's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Time-boxed access without payment.
    Trial,
    /// Paid and in good standing.
    Active,
    /// The processor reported a failed charge; access continues through the grace window.
    PastDue,
    /// Cancelled at period end; access continues until `ends_at`.
    Cancelled,
    /// The trial lapsed without a payment.
    ExpiredTrial,
    /// Paid access has ended.
    Expired,
}

impl SubscriptionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SubscriptionStatus; 6] = [
        Self::Trial,
        Self::Active,
        Self::PastDue,
        Self::Cancelled,
        Self::ExpiredTrial,
        Self::Expired,
    ];

    /// Stable string form used in storage and APIs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::ExpiredTrial => "expired_trial",
            Self::Expired => "expired",
        }
    }

    /// Whether the status has ended access for good (short of a new subscription).
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::ExpiredTrial | Self::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SubscriptionError::InvalidArgument {
                message: format!("unknown subscription status '{}'", s),
            })
    }
}

/// One tenant's subscription, as persisted.
///
/// `status` is a cache of the last resolution; time-based transitions are
/// always re-derived by the resolver from the timestamps below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// The owning tenant. Unique per store.
    pub tenant_id: String,
    /// Last resolved status.
    pub status: SubscriptionStatus,
    /// End of the trial period, if the tenant ever trialled.
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Billing-period end, end of paid access after cancellation, or the moment
    /// access was cut off for expired records.
    pub ends_at: Option<DateTime<Utc>>,
    /// Processor customer identifier.
    pub processor_customer_ref: Option<String>,
    /// Processor subscription identifier.
    pub processor_subscription_ref: Option<String>,
    /// Where lifecycle notices are sent.
    pub contact_email: Option<String>,
    /// Set when the activation notice was sent.
    pub welcome_email_sent_at: Option<DateTime<Utc>>,
    /// Set when the trial-expired notice was sent.
    pub trial_expired_notified_at: Option<DateTime<Utc>>,
    /// Set when the last renewal reminder was sent.
    pub last_reminded_at: Option<DateTime<Utc>>,
    /// Last successful reconciliation with the processor.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Write counter used for conditional writes. Bumped by the store.
    pub version: u64,
}

impl SubscriptionRecord {
    /// A fresh trial starting at `now`.
    #[must_use]
    pub fn new_trial(tenant_id: impl Into<String>, now: DateTime<Utc>, trial_length: Duration) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            status: SubscriptionStatus::Trial,
            trial_ends_at: Some(now + trial_length),
            ends_at: None,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            contact_email: None,
            welcome_email_sent_at: None,
            trial_expired_notified_at: None,
            last_reminded_at: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Set the notification address.
    #[must_use]
    pub fn with_contact_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    /// Whether the record is linked to a processor subscription.
    #[must_use]
    pub fn has_processor_subscription(&self) -> bool {
        self.processor_subscription_ref
            .as_deref()
            .is_some_and(|r| !r.is_empty())
    }

    /// Whole days until the next charge (or trial end). Zero when past or not applicable.
    #[must_use]
    pub fn days_until_next_payment(&self, now: DateTime<Utc>) -> i64 {
        let target = match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Cancelled => self.ends_at,
            SubscriptionStatus::Trial => self.ends_at.or(self.trial_ends_at),
            _ => None,
        };

        match target {
            Some(at) if at > now => (at - now).num_days(),
            _ => 0,
        }
    }

    /// Whole days left in the trial, if the record is trialling.
    #[must_use]
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.status != SubscriptionStatus::Trial {
            return None;
        }
        self.trial_ends_at
            .map(|ends| if ends > now { (ends - now).num_days() } else { 0 })
    }
}

/// Validate a tenant ID before it reaches storage.
pub fn validate_tenant_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.len() > MAX_TENANT_ID_LENGTH {
        Some("is too long")
    } else if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("must not contain whitespace or control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SubscriptionError::InvalidTenantId {
            id: id.chars().take(MAX_TENANT_ID_LENGTH).collect(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("trialing".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&SubscriptionStatus::ExpiredTrial).unwrap();
        assert_eq!(json, "\"expired_trial\"");
        let json = serde_json::to_string(&SubscriptionStatus::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
    }

    #[test]
    fn test_new_trial() {
        let now = Utc::now();
        let record = SubscriptionRecord::new_trial("tenant_1", now, Duration::days(14));
        assert_eq!(record.status, SubscriptionStatus::Trial);
        assert_eq!(record.trial_ends_at, Some(now + Duration::days(14)));
        assert!(!record.has_processor_subscription());
        assert_eq!(record.trial_days_remaining(now), Some(14));
    }

    #[test]
    fn test_days_until_next_payment() {
        let now = Utc::now();
        let mut record = SubscriptionRecord::new_trial("tenant_1", now, Duration::days(5));
        assert_eq!(record.days_until_next_payment(now), 5);

        record.status = SubscriptionStatus::Active;
        record.ends_at = Some(now + Duration::days(20) + Duration::hours(3));
        assert_eq!(record.days_until_next_payment(now), 20);

        record.ends_at = Some(now - Duration::days(1));
        assert_eq!(record.days_until_next_payment(now), 0);

        record.status = SubscriptionStatus::Expired;
        record.ends_at = Some(now + Duration::days(3));
        assert_eq!(record.days_until_next_payment(now), 0);
    }

    #[test]
    fn test_validate_tenant_id() {
        assert!(validate_tenant_id("tenant_123").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("has space").is_err());
        assert!(validate_tenant_id(&"x".repeat(200)).is_err());
    }
}
