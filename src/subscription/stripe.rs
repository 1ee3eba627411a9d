//! Live payment processor backed by `async-stripe`.
//!
//! Calls are not retried here; [`PaymentSyncService`](super::sync::PaymentSyncService)
//! and [`AdminOperations`](super::admin::AdminOperations) wrap them in
//! [`with_retry`](super::retry::with_retry). Mutations send the idempotency key
//! the caller put on the request, so every retry of one operation shares it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::error::{Result, SubscriptionError};
use super::gateway::{
    CheckoutRequest, PaymentGateway, PriceInfo, RemoteStatus, RemoteSubscription,
    SubscriptionUpdate, idempotency_key,
};

/// Error returned when an API key has the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }
    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        });
    }
    Ok(())
}

/// [`PaymentGateway`] talking to the Stripe API.
#[derive(Clone)]
pub struct LiveStripeGateway {
    client: stripe::Client,
    api_key: SecretString,
    price_id: String,
    timeout: Duration,
}

impl LiveStripeGateway {
    /// Create a gateway that sells `price_id` through checkout.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        price_id: impl Into<String>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            env!("CARGO_PKG_NAME").to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            api_key,
            price_id: price_id.into(),
            timeout: Duration::from_secs(30),
        })
    }

    /// Per-call deadline; elapsed calls fail as transient.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    /// Client that sends `key`, or a fresh key when the caller supplied none.
    fn idempotent_client(&self, operation: &str, key: Option<&str>) -> stripe::Client {
        let key = key.map_or_else(|| idempotency_key(operation), str::to_string);
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| map_stripe_error(e, operation)),
            Err(_) => Err(SubscriptionError::transient(operation, "request timed out")),
        }
    }
}

impl std::fmt::Debug for LiveStripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeGateway")
            .field("price_id", &self.price_id)
            .field("timeout", &self.timeout)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn parse_subscription_id(operation: &str, id: &str) -> Result<stripe::SubscriptionId> {
    id.parse()
        .map_err(|_| SubscriptionError::permanent(operation, format!("invalid subscription id: {}", id)))
}

fn parse_customer_id(operation: &str, id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| SubscriptionError::permanent(operation, format!("invalid customer id: {}", id)))
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> SubscriptionError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            SubscriptionError::from_http_status(operation, request_error.http_status, message)
        }
        stripe::StripeError::Timeout => SubscriptionError::transient(operation, "request timed out"),
        stripe::StripeError::ClientError(msg) => {
            SubscriptionError::transient(operation, format!("HTTP client error: {}", msg))
        }
        other => SubscriptionError::permanent(operation, other.to_string()),
    }
}

fn remote_status(status: &stripe::SubscriptionStatus) -> RemoteStatus {
    match status {
        stripe::SubscriptionStatus::Active => RemoteStatus::Active,
        stripe::SubscriptionStatus::Canceled => RemoteStatus::Canceled,
        stripe::SubscriptionStatus::Incomplete => RemoteStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => RemoteStatus::IncompleteExpired,
        stripe::SubscriptionStatus::PastDue => RemoteStatus::PastDue,
        stripe::SubscriptionStatus::Trialing => RemoteStatus::Trialing,
        stripe::SubscriptionStatus::Unpaid => RemoteStatus::Unpaid,
        stripe::SubscriptionStatus::Paused => RemoteStatus::Paused,
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn to_remote(sub: stripe::Subscription) -> RemoteSubscription {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    RemoteSubscription {
        id: sub.id.to_string(),
        customer_id: Some(customer_id),
        status: remote_status(&sub.status),
        current_period_end: timestamp(sub.current_period_end),
        trial_end: sub.trial_end.and_then(timestamp),
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

#[async_trait]
impl PaymentGateway for LiveStripeGateway {
    async fn retrieve(&self, subscription_ref: &str) -> Result<RemoteSubscription> {
        let sub_id = parse_subscription_id("retrieve", subscription_ref)?;
        let sub = self
            .call(
                "retrieve",
                stripe::Subscription::retrieve(&self.client, &sub_id, &[]),
            )
            .await?;
        Ok(to_remote(sub))
    }

    async fn update(
        &self,
        subscription_ref: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription> {
        let client =
            self.idempotent_client("update_subscription", update.idempotency_key.as_deref());
        let sub_id = parse_subscription_id("update", subscription_ref)?;

        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = update.cancel_at_period_end;

        let sub = self
            .call(
                "update",
                stripe::Subscription::update(&client, &sub_id, params),
            )
            .await?;
        Ok(to_remote(sub))
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String> {
        const OP: &str = "create_checkout_session";
        let client = self.idempotent_client(OP, request.idempotency_key.as_deref());

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.tenant_id);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(self.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        match (&request.customer_ref, &request.contact_email) {
            (Some(customer), _) => params.customer = Some(parse_customer_id(OP, customer)?),
            (None, Some(email)) => params.customer_email = Some(email),
            (None, None) => {}
        }

        let session = self
            .call(OP, stripe::CheckoutSession::create(&client, params))
            .await?;
        session
            .url
            .ok_or_else(|| SubscriptionError::permanent(OP, "checkout session URL missing"))
    }

    async fn create_portal_session(&self, customer_ref: &str, return_url: &str) -> Result<String> {
        const OP: &str = "create_portal_session";
        let customer_id = parse_customer_id(OP, customer_ref)?;

        let mut params = stripe::CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = self
            .call(OP, stripe::BillingPortalSession::create(&self.client, params))
            .await?;
        Ok(session.url)
    }

    async fn price(&self) -> Result<Option<PriceInfo>> {
        const OP: &str = "retrieve_price";
        let price_id = self
            .price_id
            .parse::<stripe::PriceId>()
            .map_err(|_| SubscriptionError::permanent(OP, "invalid price id"))?;

        let price = self
            .call(OP, stripe::Price::retrieve(&self.client, &price_id, &[]))
            .await?;
        Ok(to_price_info(price))
    }
}

/// One-off prices and prices without an amount carry no recurring revenue.
fn to_price_info(price: stripe::Price) -> Option<PriceInfo> {
    let recurring = price.recurring?;
    Some(PriceInfo {
        amount_minor: price.unit_amount?,
        currency: price.currency.map(|c| c.to_string()).unwrap_or_default(),
        interval: recurring.interval.as_str().to_string(),
        interval_count: recurring.interval_count,
    })
}
