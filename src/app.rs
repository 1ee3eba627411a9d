use secrecy::SecretString;
use std::sync::Arc;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::email::ConsoleMailer;
use crate::expiring::InMemoryExpiringStore;
use crate::jobs::MaintenanceWorker;
use crate::subscription::{
    AccessGate, AdminOperations, AnalyticsService, ImpersonationManager, InMemorySubscriptionStore,
    NotificationScheduler, NullGateway, PaymentGateway, PaymentSyncService, StatusResolver,
    SubscriptionStore, WebhookHandler,
};
use crate::traits::expiring::ExpiringStore;
use crate::traits::mailer::Mailer;

/// Every subscription service wired to one set of collaborators.
///
/// Services are cheap to clone and share the same store, gateway and clock.
#[derive(Clone)]
pub struct SubscriptionEngine {
    pub config: Config,
    pub resolver: StatusResolver,
    pub store: Arc<dyn SubscriptionStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
    pub gate: AccessGate,
    pub admin: AdminOperations,
    pub sync: PaymentSyncService,
    pub notices: NotificationScheduler,
    pub impersonation: ImpersonationManager,
    pub analytics: AnalyticsService,
    /// Present when a webhook signing secret was configured.
    pub webhooks: Option<WebhookHandler>,
}

impl SubscriptionEngine {
    /// Builder pattern for constructing the engine
    pub fn builder() -> SubscriptionEngineBuilder {
        SubscriptionEngineBuilder::new()
    }

    /// A maintenance worker over this engine's sync service and notices.
    pub fn maintenance_worker(&self) -> MaintenanceWorker {
        MaintenanceWorker::new(
            self.sync.clone(),
            self.notices.clone(),
            self.resolver,
            self.clock.clone(),
            self.config.maintenance.clone(),
        )
    }
}

/// Builder for SubscriptionEngine with fluent API
///
/// Anything not set falls back to an in-process default: in-memory stores,
/// no payment processor, console mailer, tracing audit log and the system clock.
#[must_use = "builder does nothing until you call build()"]
#[derive(Default)]
pub struct SubscriptionEngineBuilder {
    store: Option<Arc<dyn SubscriptionStore>>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    mailer: Option<Arc<dyn Mailer>>,
    expiring: Option<Arc<dyn ExpiringStore>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Option<Arc<dyn Clock>>,
    webhook_secret: Option<SecretString>,
}

impl SubscriptionEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Store backing impersonation sessions
    pub fn with_expiring_store(mut self, store: Arc<dyn ExpiringStore>) -> Self {
        self.expiring = Some(store);
        self
    }

    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Signing secret for processor webhooks. Without it the webhook route answers 503.
    pub fn with_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn build(self, config: &Config) -> SubscriptionEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new()));
        let gateway = self.gateway.unwrap_or_else(|| Arc::new(NullGateway));
        let mailer = self.mailer.unwrap_or_else(|| Arc::new(ConsoleMailer::new()));
        let expiring = self
            .expiring
            .unwrap_or_else(|| Arc::new(InMemoryExpiringStore::default()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditLogger));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        if !gateway.is_configured() {
            tracing::warn!(
                target: "subscription.lifecycle",
                "No payment processor configured; sync, checkout and cancellation will fail"
            );
        }

        let resolver = config.resolver();
        let notices =
            NotificationScheduler::new(store.clone(), mailer, config.notification_config());
        let gate = AccessGate::new(
            store.clone(),
            resolver,
            clock.clone(),
            config.access_config(),
        );
        let admin = AdminOperations::new(
            store.clone(),
            gateway.clone(),
            notices.clone(),
            audit.clone(),
            resolver,
            clock.clone(),
            config.admin_config(),
        );
        let sync = PaymentSyncService::new(
            store.clone(),
            gateway.clone(),
            notices.clone(),
            audit.clone(),
            clock.clone(),
            config.sync_config(),
        );
        let webhooks = self.webhook_secret.map(|secret| {
            WebhookHandler::new(
                sync.clone(),
                store.clone(),
                expiring.clone(),
                clock.clone(),
                secret,
            )
            .with_tolerance(config.webhook_tolerance())
        });
        let impersonation =
            ImpersonationManager::new(expiring, clock.clone(), audit, config.impersonation_ttl());
        let analytics = AnalyticsService::new(
            store.clone(),
            gateway.clone(),
            resolver,
            clock.clone(),
            config.health_stale_after(),
        );

        SubscriptionEngine {
            config: config.clone(),
            resolver,
            store,
            gateway,
            clock,
            gate,
            admin,
            sync,
            notices,
            impersonation,
            analytics,
            webhooks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ConfigBuilder;
    use crate::traits::auth::Caller;

    #[tokio::test]
    async fn test_default_engine_runs_trial_lifecycle() {
        let config = ConfigBuilder::new().with_trial_days(7).build().unwrap();
        let clock = ManualClock::default();
        let engine = SubscriptionEngine::builder()
            .with_clock(Arc::new(clock.clone()))
            .build(&config);

        engine.admin.create_trial("tenant_1", None).await.unwrap();
        assert!(engine.gate.check_access("tenant_1").await.allowed);

        clock.advance(chrono::Duration::days(8));
        assert!(!engine.gate.check_access("tenant_1").await.allowed);

        assert!(!engine.analytics.health().await.unwrap().processor_configured);
        assert!(engine.webhooks.is_none());
        assert!(
            engine
                .impersonation
                .start(&Caller::operator("admin"), "user_1")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_webhook_secret_enables_handler() {
        let config = ConfigBuilder::new().build().unwrap();
        let engine = SubscriptionEngine::builder()
            .with_webhook_secret("whsec_test")
            .build(&config);
        let handler = engine.webhooks.expect("handler is built");
        assert!(!format!("{:?}", handler).contains("whsec_test"));
    }
}
