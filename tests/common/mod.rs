//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use subscription_gate::subscription::{
    CheckoutRequest, InMemorySubscriptionStore, PaymentGateway, RemoteStatus, RemoteSubscription,
    Result, SubscriptionError, SubscriptionUpdate,
};
use subscription_gate::{
    Clock, Config, ConfigBuilder, Email, Mailer, ManualClock, SubscriptionEngine,
    SubscriptionRecord, SubscriptionStatus, SubscriptionStore,
};

/// Processor double answering from a fixed table of subscriptions.
#[derive(Default, Clone)]
pub struct ScriptedGateway {
    subscriptions: Arc<Mutex<HashMap<String, RemoteSubscription>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    retrieve_calls: Arc<AtomicUsize>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, subscription: RemoteSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    /// Every call for this subscription fails with a transient error.
    pub fn make_unreachable(&self, subscription_ref: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(subscription_ref.to_string());
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, operation: &str, subscription_ref: &str) -> Result<RemoteSubscription> {
        if self.unreachable.lock().unwrap().contains(subscription_ref) {
            return Err(SubscriptionError::transient(operation, "connection reset by peer"));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| {
                SubscriptionError::from_http_status(operation, 404, "No such subscription")
            })
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn retrieve(&self, subscription_ref: &str) -> Result<RemoteSubscription> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup("retrieve", subscription_ref)
    }

    async fn update(
        &self,
        subscription_ref: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription> {
        let mut subscription = self.lookup("update", subscription_ref)?;
        if let Some(cancel) = update.cancel_at_period_end {
            subscription.cancel_at_period_end = cancel;
        }
        self.put(subscription.clone());
        Ok(subscription)
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String> {
        Ok(format!("https://checkout.test/{}", request.tenant_id))
    }

    async fn create_portal_session(&self, customer_ref: &str, _return_url: &str) -> Result<String> {
        Ok(format!("https://portal.test/{}", customer_ref))
    }
}

/// Mailer keeping every notice handed to it.
#[derive(Default, Clone)]
pub struct CollectingMailer {
    sent: Arc<Mutex<Vec<Email>>>,
}

impl CollectingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.subject.clone())
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.subjects().iter().filter(|s| s.contains(needle)).count()
    }
}

#[async_trait]
impl Mailer for CollectingMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// An engine over in-memory collaborators the test can reach into.
pub struct TestEngine {
    pub engine: SubscriptionEngine,
    pub store: InMemorySubscriptionStore,
    pub gateway: ScriptedGateway,
    pub mailer: CollectingMailer,
    pub clock: ManualClock,
}

impl TestEngine {
    pub fn new() -> Self {
        let config = ConfigBuilder::new()
            .build()
            .expect("default config is valid");
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Self {
        Self::build(config, None)
    }

    /// Default config plus a webhook signing secret.
    pub fn with_webhook_secret(secret: &str) -> Self {
        let config = ConfigBuilder::new()
            .build()
            .expect("default config is valid");
        Self::build(&config, Some(secret))
    }

    fn build(config: &Config, webhook_secret: Option<&str>) -> Self {
        let store = InMemorySubscriptionStore::new();
        let gateway = ScriptedGateway::new();
        let mailer = CollectingMailer::new();
        let clock = ManualClock::default();

        let mut builder = SubscriptionEngine::builder()
            .with_store(Arc::new(store.clone()))
            .with_gateway(Arc::new(gateway.clone()))
            .with_mailer(Arc::new(mailer.clone()))
            .with_clock(Arc::new(clock.clone()));
        if let Some(secret) = webhook_secret {
            builder = builder.with_webhook_secret(secret.to_string());
        }
        let engine = builder.build(config);

        Self {
            engine,
            store,
            gateway,
            mailer,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Store a record in `status` with the given end instants.
    pub async fn seed(
        &self,
        tenant_id: &str,
        status: SubscriptionStatus,
        trial_ends_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_trial(tenant_id, self.now(), Duration::days(14))
            .with_contact_email(format!("owner@{}.test", tenant_id));
        record.status = status;
        record.trial_ends_at = trial_ends_at;
        record.ends_at = ends_at;
        self.store.insert(&record).await.unwrap()
    }

    /// Store a trial linked to processor subscription `subscription_ref`.
    pub async fn seed_linked(&self, tenant_id: &str, subscription_ref: &str) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_trial(tenant_id, self.now(), Duration::days(14))
            .with_contact_email(format!("owner@{}.test", tenant_id));
        record.processor_subscription_ref = Some(subscription_ref.to_string());
        self.store.insert(&record).await.unwrap()
    }

    pub async fn record(&self, tenant_id: &str) -> SubscriptionRecord {
        self.store.get(tenant_id).await.unwrap().unwrap()
    }
}

pub fn remote(id: &str, status: RemoteStatus, period_end: DateTime<Utc>) -> RemoteSubscription {
    RemoteSubscription {
        id: id.to_string(),
        customer_id: Some(format!("cus_{}", id)),
        status,
        current_period_end: Some(period_end),
        trial_end: None,
        cancel_at_period_end: false,
    }
}

/// `Stripe-Signature` header value for `payload` signed at `timestamp`.
pub fn sign_webhook(secret: &str, payload: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};

    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
