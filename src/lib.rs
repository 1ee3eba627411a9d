//! subscription-gate - subscription lifecycle and access control for multi-tenant SaaS
//!
//! Derives each tenant's effective subscription status from its record and the
//! clock, reconciles records with a payment processor, and answers one question
//! for every protected surface: may this tenant get in?
//!
//! # Features
//!
//! - **Lifecycle**: trial, active, past due, cancelled and expired states with a grace window
//! - **Sync**: bounded-concurrency reconciliation with retry and idempotent notices
//! - **Access**: one gate for dashboards, registration and public booking forms
//! - **Admin**: extend, cancel, force-expire, reactivate, bulk actions and impersonation
//! - **HTTP**: axum routes and page-load middleware
//! - `stripe` feature: live payment processor on `async-stripe`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use subscription_gate::{ConfigBuilder, SubscriptionEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     subscription_gate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let engine = SubscriptionEngine::builder().build(&config);
//!
//!     let maintenance = engine.maintenance_worker().spawn();
//!     let app = subscription_gate::http::routes(engine);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     maintenance.shutdown().await;
//!     Ok(())
//! }
//! ```

mod app;
pub mod audit;
pub mod clock;
mod config;
pub mod email;
mod error;
pub mod expiring;
pub mod http;
pub mod jobs;
pub mod subscription;
pub mod traits;
mod utils;

// Re-exports for public API
pub use app::{SubscriptionEngine, SubscriptionEngineBuilder};
pub use audit::{AuditLogger, LifecycleAuditEvent, NoOpAuditLogger, TracingAuditLogger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AccessSettings, Config, ConfigBuilder, ConfigError, LifecycleSettings, LoggingConfig,
    SyncSettings, WebhookSettings,
};
pub use error::{ErrorResponse, GateError, Result};
pub use jobs::{MaintenanceConfig, MaintenanceHandle, MaintenanceWorker};
pub use subscription::{
    AccessGate, AdminOperations, AnalyticsService, ImpersonationManager, NotificationScheduler,
    NullGateway, PaymentGateway, PaymentSyncService, StatusResolver, SubscriptionError,
    SubscriptionRecord, SubscriptionStatus, SubscriptionStore,
};
pub use traits::auth::{AuthContext, Caller};
pub use traits::expiring::ExpiringStore;
pub use traits::mailer::{Email, Mailer};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "subscription=debug")
/// - `SUBGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
