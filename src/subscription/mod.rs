//! Subscription lifecycle and access control.
//!
//! Each tenant owns one [`SubscriptionRecord`]. Its status is driven by two
//! sources: the payment processor, reconciled by [`PaymentSyncService`], and
//! operators, through [`AdminOperations`]. Wall-clock transitions (lapsed
//! trials, ended grace periods) are computed by [`StatusResolver`] on read and
//! persisted lazily. [`AccessGate`] answers "may this tenant use this surface".
//!
//! # Example
//!
//! ```rust,ignore
//! use subscription_gate::subscription::{AccessContext, Surface};
//!
//! let engine = SubscriptionEngine::builder().build(&config);
//!
//! engine.admin.create_trial("tenant_1", Some("owner@example.com".into())).await?;
//!
//! let check = engine.gate.check_access("tenant_1").await;
//! assert!(check.allowed);
//!
//! // Public booking form of the same tenant
//! let ctx = AccessContext::for_booking_form("tenant_1");
//! if !engine.gate.is_allowed(&ctx).await {
//!     // render BOOKING_FORM_UNAVAILABLE_MESSAGE
//! }
//! ```

pub mod admin;
pub mod analytics;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod impersonation;
pub mod notify;
pub mod record;
pub mod resolver;
pub mod retry;
pub mod storage;
#[cfg(feature = "stripe")]
pub mod stripe;
pub mod sync;
pub mod update;
pub mod webhook;

pub use admin::{
    ALREADY_CANCELLED_MESSAGE, AdminConfig, AdminOperations, BulkActionKind, BulkActionResult,
    CANCEL_IN_PROGRESS_MESSAGE, CANCELLED_MESSAGE, CancelOutcome, CancelResult, ReturnUrls,
    TRIAL_CANCELLED_MESSAGE,
};
pub use analytics::{AnalyticsService, HealthReport, HealthStatus, SubscriptionAnalytics};
pub use error::{ProcessorFailure, Result, SubscriptionError};
pub use gate::{
    AccessCheck, AccessConfig, AccessContext, AccessDecision, AccessGate,
    BOOKING_FORM_UNAVAILABLE_MESSAGE, DEFAULT_REDIRECT_PATH, Surface,
};
pub use gateway::{
    CheckoutRequest, NullGateway, PaymentGateway, PriceInfo, RemoteStatus, RemoteSubscription,
    SubscriptionUpdate, idempotency_key,
};
pub use impersonation::{
    DEFAULT_IMPERSONATION_TTL, EndImpersonation, ImpersonationManager, ImpersonationSession,
};
pub use notify::{DailyReport, Notice, NotificationConfig, NotificationScheduler};
pub use record::{SubscriptionRecord, SubscriptionStatus, validate_tenant_id};
pub use resolver::{DEFAULT_GRACE_WINDOW, Resolution, StatusResolver};
pub use retry::{RetryPolicy, with_retry};
pub use storage::{InMemorySubscriptionStore, RecordFilter, SubscriptionStore};
#[cfg(feature = "stripe")]
pub use stripe::{InvalidApiKeyError, LiveStripeGateway};
pub use sync::{BatchReport, PaymentSyncService, SyncConfig, SyncFailure, SyncResult};
pub use update::{Update, conditional_update};
pub use webhook::{
    DEFAULT_SIGNATURE_TOLERANCE, WebhookEvent, WebhookEventData, WebhookHandler, WebhookOutcome,
};
