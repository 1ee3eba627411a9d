//! Payment processor webhooks.
//!
//! Verifies the `Stripe-Signature` header and drops duplicate deliveries. Each
//! relevant event then becomes a [`link`](PaymentSyncService::link) or a
//! [`sync`](PaymentSyncService::sync). The payload is only used to find the
//! tenant. Subscription state is always re-read from the processor, so
//! out-of-order deliveries converge on the processor's current view.

use chrono::Duration;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::{Result, SubscriptionError};
use super::record::{SubscriptionStatus, validate_tenant_id};
use super::storage::{RecordFilter, SubscriptionStore};
use super::sync::{PaymentSyncService, SyncResult};
use crate::clock::Clock;
use crate::traits::expiring::ExpiringStore;

/// Default allowed skew between the signature timestamp and now.
pub const DEFAULT_SIGNATURE_TOLERANCE: Duration = Duration::seconds(300);

/// Processed event ids are remembered for as long as the processor retries.
const PROCESSED_EVENT_TTL: std::time::Duration = std::time::Duration::from_secs(3 * 24 * 60 * 60);

/// Parsed webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    /// Event type, e.g. `checkout.session.completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The tenant was linked or synced.
    Processed {
        tenant_id: String,
        status: SubscriptionStatus,
    },
    /// Not an event we act on, or no tenant is linked to its subscription.
    Ignored,
    /// Duplicate delivery.
    AlreadyProcessed,
}

impl From<SyncResult> for WebhookOutcome {
    fn from(result: SyncResult) -> Self {
        Self::Processed {
            tenant_id: result.tenant_id,
            status: result.status,
        }
    }
}

/// Verifies and routes processor webhooks.
///
/// The signing secret is held in a [`SecretString`] and never appears in
/// debug output.
#[derive(Clone)]
pub struct WebhookHandler {
    sync: PaymentSyncService,
    store: Arc<dyn SubscriptionStore>,
    processed: Arc<dyn ExpiringStore>,
    clock: Arc<dyn Clock>,
    secret: Arc<SecretString>,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookHandler")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookHandler {
    pub fn new(
        sync: PaymentSyncService,
        store: Arc<dyn SubscriptionStore>,
        processed: Arc<dyn ExpiringStore>,
        clock: Arc<dyn Clock>,
        secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            sync,
            store,
            processed,
            clock,
            secret: Arc::new(secret.into()),
            tolerance: DEFAULT_SIGNATURE_TOLERANCE,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verify the signature header against the raw body and parse the event.
    ///
    /// # Errors
    /// [`SubscriptionError::InvalidWebhook`] when the header is malformed, the
    /// timestamp is outside the tolerance, no `v1` signature matches, or the
    /// body is not an event.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        let parts = parse_signature_header(signature_header)?;

        let skew = (self.clock.now().timestamp() - parts.timestamp).abs();
        if skew > self.tolerance.num_seconds() {
            tracing::warn!(
                target: "subscription.webhook",
                skew_secs = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(invalid("timestamp outside tolerance"));
        }

        let expected = compute_signature(self.secret.expose_secret(), parts.timestamp, payload)?;
        // Several v1 entries are sent while the signing secret rotates.
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .is_ok_and(|provided| bool::from(expected.as_slice().ct_eq(provided.as_slice())))
        });
        if !matched {
            tracing::warn!(target: "subscription.webhook", "Webhook signature mismatch");
            return Err(invalid("signature mismatch"));
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "subscription.webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            invalid("malformed event payload")
        })
    }

    /// Verify, then handle. Convenience for HTTP handlers.
    pub async fn receive(&self, payload: &[u8], signature_header: &str) -> Result<WebhookOutcome> {
        let event = self.verify(payload, signature_header)?;
        self.handle_event(&event).await
    }

    /// Route a verified event.
    ///
    /// A failed link or sync is returned as an error and the event is not
    /// marked processed, so the processor's redelivery tries again.
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let key = format!("webhook_event:{}", event.id);
        if self.processed.get_bytes(&key).await?.is_some() {
            tracing::debug!(target: "subscription.webhook", event_id = %event.id, "Duplicate webhook");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let object = &event.data.object;
        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => self.checkout_completed(object).await?,
            "invoice.payment_succeeded" | "invoice.paid" | "invoice.payment_failed" => {
                self.sync_subscription(string_field(object, "subscription")).await?
            }
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                self.sync_subscription(string_field(object, "id")).await?
            }
            _ => WebhookOutcome::Ignored,
        };

        if !matches!(outcome, WebhookOutcome::Ignored) {
            self.processed
                .set_bytes(&key, event.event_type.clone().into_bytes(), PROCESSED_EVENT_TTL)
                .await?;
        }

        tracing::info!(
            target: "subscription.webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Webhook handled"
        );
        Ok(outcome)
    }

    /// Checkout carries the tenant as its client reference.
    async fn checkout_completed(&self, session: &serde_json::Value) -> Result<WebhookOutcome> {
        let (Some(tenant_id), Some(subscription_ref)) = (
            string_field(session, "client_reference_id"),
            string_field(session, "subscription"),
        ) else {
            // One-off payment or a session started outside this engine.
            return Ok(WebhookOutcome::Ignored);
        };
        if validate_tenant_id(tenant_id).is_err() {
            tracing::warn!(
                target: "subscription.webhook",
                client_reference_id = %tenant_id,
                "Checkout completed with an unusable client reference"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        match self.sync.link(tenant_id, subscription_ref).await {
            Ok(result) => Ok(result.into()),
            Err(SubscriptionError::NoSubscription { .. }) => {
                tracing::warn!(
                    target: "subscription.webhook",
                    tenant_id = %tenant_id,
                    subscription_ref = %subscription_ref,
                    "Checkout completed for a tenant without a record"
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_subscription(&self, subscription_ref: Option<&str>) -> Result<WebhookOutcome> {
        let Some(subscription_ref) = subscription_ref else {
            return Ok(WebhookOutcome::Ignored);
        };
        let linked = self
            .store
            .list(&RecordFilter::for_subscription_ref(subscription_ref).limit(1))
            .await?;
        let Some(record) = linked.into_iter().next() else {
            tracing::info!(
                target: "subscription.webhook",
                subscription_ref = %subscription_ref,
                "No tenant linked to subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        Ok(self.sync.sync(&record.tenant_id).await?.into())
    }
}

fn string_field<'a>(object: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
}

fn invalid(message: &str) -> SubscriptionError {
    SubscriptionError::InvalidWebhook {
        message: message.to_string(),
    }
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`. Other schemes are ignored.
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid("malformed signature header"))?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| invalid("missing timestamp in signature header"))?;
    if signatures.is_empty() {
        return Err(invalid("missing v1 signature"));
    }
    Ok(SignatureParts { timestamp, signatures })
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`.
fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| invalid("unusable signing secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
