//! Payment processor interface.
//!
//! The lifecycle engine never talks to a processor SDK directly. It consumes
//! [`PaymentGateway`], which has a live implementation behind the `stripe`
//! feature, a [`NullGateway`] for deployments without payments, and a mock for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{Result, SubscriptionError};
use super::record::SubscriptionStatus;

/// Subscription status as reported by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    /// Awaiting the first payment.
    Incomplete,
    /// The first payment never arrived.
    IncompleteExpired,
    Paused,
}

impl RemoteStatus {
    /// Parse the processor's status string.
    ///
    /// Unknown values are treated as `incomplete`, which leaves local state alone.
    #[must_use]
    pub fn from_processor(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Incomplete,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
        }
    }

    /// Whether the processor considers the subscription paid up.
    #[must_use]
    pub fn is_good_standing(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The processor's view of a tenant's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    /// Processor subscription identifier.
    pub id: String,
    /// Processor customer identifier.
    pub customer_id: Option<String>,
    pub status: RemoteStatus,
    /// End of the current billing period.
    pub current_period_end: Option<DateTime<Utc>>,
    /// End of the processor-side trial, if any.
    pub trial_end: Option<DateTime<Utc>>,
    /// Whether cancellation is scheduled for the period end.
    pub cancel_at_period_end: bool,
}

impl RemoteSubscription {
    /// The local status this remote state maps to at `now`, or `None` when the
    /// remote state should not move the local record.
    #[must_use]
    pub fn local_status(&self, now: DateTime<Utc>) -> Option<SubscriptionStatus> {
        match self.status {
            RemoteStatus::Active if self.cancel_at_period_end => Some(SubscriptionStatus::Cancelled),
            RemoteStatus::Active => Some(SubscriptionStatus::Active),
            RemoteStatus::Trialing => Some(SubscriptionStatus::Trial),
            RemoteStatus::PastDue | RemoteStatus::Unpaid => Some(SubscriptionStatus::PastDue),
            RemoteStatus::Canceled => match self.current_period_end {
                Some(end) if end > now => Some(SubscriptionStatus::Cancelled),
                _ => Some(SubscriptionStatus::Expired),
            },
            RemoteStatus::IncompleteExpired => Some(SubscriptionStatus::Expired),
            RemoteStatus::Incomplete | RemoteStatus::Paused => None,
        }
    }
}

/// A fresh idempotency key for one logical processor mutation.
///
/// Generate it once, before any retry loop, and reuse it on every attempt.
#[must_use]
pub fn idempotency_key(operation: &str) -> String {
    format!("{}_{}", operation, uuid::Uuid::new_v4())
}

/// Fields to change on a processor subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// Schedule (or unschedule) cancellation at period end.
    pub cancel_at_period_end: Option<bool>,
    /// Sent with every attempt of this update.
    pub idempotency_key: Option<String>,
}

impl SubscriptionUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = Some(cancel);
        self
    }

    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Request for a hosted checkout page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub tenant_id: String,
    /// Existing processor customer, if the tenant has one.
    pub customer_ref: Option<String>,
    /// Used to create the customer when there is none yet.
    pub contact_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    /// Sent with every attempt, so a retried request opens one session.
    pub idempotency_key: Option<String>,
}

/// The recurring price tenants subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    /// Unit amount in the currency's minor unit.
    pub amount_minor: i64,
    pub currency: String,
    /// Billing interval: `day`, `week`, `month` or `year`.
    pub interval: String,
    pub interval_count: u64,
}

impl PriceInfo {
    /// Amount billed per month in the minor unit, for monthly prices only.
    #[must_use]
    pub fn monthly_amount_minor(&self) -> Option<i64> {
        if self.interval != "month" {
            return None;
        }
        let count = i64::try_from(self.interval_count.max(1)).unwrap_or(1);
        Some(self.amount_minor / count)
    }
}

/// Trait for payment processor operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Whether a real processor sits behind this gateway.
    fn is_configured(&self) -> bool {
        true
    }

    /// Fetch the current state of a processor subscription.
    async fn retrieve(&self, subscription_ref: &str) -> Result<RemoteSubscription>;

    /// Apply changes to a processor subscription.
    async fn update(
        &self,
        subscription_ref: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription>;

    /// Create a hosted checkout session and return its URL.
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String>;

    /// Create a customer self-service portal session and return its URL.
    async fn create_portal_session(&self, customer_ref: &str, return_url: &str) -> Result<String>;

    /// The price sold through checkout, when the processor exposes one.
    async fn price(&self) -> Result<Option<PriceInfo>> {
        Ok(None)
    }
}

#[async_trait]
impl<G: PaymentGateway + ?Sized> PaymentGateway for Arc<G> {
    fn is_configured(&self) -> bool {
        (**self).is_configured()
    }

    async fn retrieve(&self, subscription_ref: &str) -> Result<RemoteSubscription> {
        (**self).retrieve(subscription_ref).await
    }

    async fn update(
        &self,
        subscription_ref: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription> {
        (**self).update(subscription_ref, update).await
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String> {
        (**self).create_checkout_session(request).await
    }

    async fn create_portal_session(&self, customer_ref: &str, return_url: &str) -> Result<String> {
        (**self).create_portal_session(customer_ref, return_url).await
    }

    async fn price(&self) -> Result<Option<PriceInfo>> {
        (**self).price().await
    }
}

/// Gateway for deployments without a payment processor.
///
/// Every call fails with [`SubscriptionError::ProcessorNotConfigured`]; sync
/// and cancellation report that cleanly instead of probing for an SDK at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGateway;

#[async_trait]
impl PaymentGateway for NullGateway {
    fn is_configured(&self) -> bool {
        false
    }

    async fn retrieve(&self, _subscription_ref: &str) -> Result<RemoteSubscription> {
        Err(SubscriptionError::ProcessorNotConfigured {
            operation: "retrieve".to_string(),
        })
    }

    async fn update(
        &self,
        _subscription_ref: &str,
        _update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription> {
        Err(SubscriptionError::ProcessorNotConfigured {
            operation: "update".to_string(),
        })
    }

    async fn create_checkout_session(&self, _request: &CheckoutRequest) -> Result<String> {
        Err(SubscriptionError::ProcessorNotConfigured {
            operation: "create_checkout_session".to_string(),
        })
    }

    async fn create_portal_session(&self, _customer_ref: &str, _return_url: &str) -> Result<String> {
        Err(SubscriptionError::ProcessorNotConfigured {
            operation: "create_portal_session".to_string(),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock payment gateway with scripted failures and call counting.
    #[derive(Default, Clone)]
    pub struct MockPaymentGateway {
        inner: Arc<Mutex<MockState>>,
    }

    #[derive(Default)]
    struct MockState {
        subscriptions: HashMap<String, RemoteSubscription>,
        failures: HashMap<String, (SubscriptionError, u32)>,
        calls: HashMap<&'static str, u32>,
        idempotency_keys: Vec<Option<String>>,
        price: Option<PriceInfo>,
    }

    impl MockPaymentGateway {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add or replace a remote subscription.
        pub fn add_subscription(&self, subscription: RemoteSubscription) {
            self.inner
                .lock()
                .unwrap()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        /// Current remote state of a subscription.
        pub fn subscription(&self, id: &str) -> Option<RemoteSubscription> {
            self.inner.lock().unwrap().subscriptions.get(id).cloned()
        }

        /// Make the next `times` calls touching `subscription_ref` fail with `error`.
        pub fn fail_next(&self, subscription_ref: &str, error: SubscriptionError, times: u32) {
            self.inner
                .lock()
                .unwrap()
                .failures
                .insert(subscription_ref.to_string(), (error, times));
        }

        /// Set the price returned by [`PaymentGateway::price`].
        pub fn set_price(&self, price: Option<PriceInfo>) {
            self.inner.lock().unwrap().price = price;
        }

        /// Idempotency keys of every mutation attempt, in call order.
        pub fn idempotency_keys(&self) -> Vec<Option<String>> {
            self.inner.lock().unwrap().idempotency_keys.clone()
        }

        /// How many times an operation was called.
        pub fn calls(&self, operation: &str) -> u32 {
            self.inner
                .lock()
                .unwrap()
                .calls
                .get(operation)
                .copied()
                .unwrap_or(0)
        }

        fn record_call(&self, operation: &'static str, subscription_ref: &str) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            *state.calls.entry(operation).or_default() += 1;

            if let Some((error, remaining)) = state.failures.get_mut(subscription_ref) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
            Ok(())
        }

        fn not_found(operation: &str, id: &str) -> SubscriptionError {
            SubscriptionError::from_http_status(
                operation,
                404,
                format!("No such subscription: '{}'", id),
            )
        }
    }

    #[async_trait]
    impl PaymentGateway for MockPaymentGateway {
        async fn retrieve(&self, subscription_ref: &str) -> Result<RemoteSubscription> {
            self.record_call("retrieve", subscription_ref)?;
            self.subscription(subscription_ref)
                .ok_or_else(|| Self::not_found("retrieve", subscription_ref))
        }

        async fn update(
            &self,
            subscription_ref: &str,
            update: &SubscriptionUpdate,
        ) -> Result<RemoteSubscription> {
            self.inner
                .lock()
                .unwrap()
                .idempotency_keys
                .push(update.idempotency_key.clone());
            self.record_call("update", subscription_ref)?;
            let mut state = self.inner.lock().unwrap();
            let sub = state
                .subscriptions
                .get_mut(subscription_ref)
                .ok_or_else(|| Self::not_found("update", subscription_ref))?;
            if let Some(cancel) = update.cancel_at_period_end {
                sub.cancel_at_period_end = cancel;
            }
            Ok(sub.clone())
        }

        async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String> {
            self.inner
                .lock()
                .unwrap()
                .idempotency_keys
                .push(request.idempotency_key.clone());
            self.record_call("create_checkout_session", &request.tenant_id)?;
            Ok(format!("https://checkout.example.com/c/{}", request.tenant_id))
        }

        async fn create_portal_session(&self, customer_ref: &str, _return_url: &str) -> Result<String> {
            self.record_call("create_portal_session", customer_ref)?;
            Ok(format!("https://billing.example.com/p/{}", customer_ref))
        }

        async fn price(&self) -> Result<Option<PriceInfo>> {
            Ok(self.inner.lock().unwrap().price.clone())
        }
    }
}
