//! Audit trail for lifecycle mutations.
//!
//! Every administrative mutation, cancellation, impersonation and
//! processor-driven transition is reported to an [`AuditLogger`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::subscription::record::SubscriptionStatus;

/// Audit event types for subscription lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAuditEvent {
    /// Trial created at registration.
    TrialCreated {
        tenant_id: String,
        trial_ends_at: DateTime<Utc>,
    },
    /// Trial extended by an operator.
    TrialExtended {
        tenant_id: String,
        actor: String,
        days: u32,
        trial_ends_at: DateTime<Utc>,
    },
    /// Trial ended early by the tenant.
    TrialCancelled { tenant_id: String, actor: String },
    /// Access revoked by an operator.
    ForceExpired {
        tenant_id: String,
        actor: String,
        previous: SubscriptionStatus,
    },
    /// Access restored locally by an operator, without processor contact.
    Reactivated {
        tenant_id: String,
        actor: String,
        previous: SubscriptionStatus,
    },
    /// Cancellation scheduled at period end.
    SubscriptionCancelled {
        tenant_id: String,
        actor: String,
        access_until: Option<DateTime<Utc>>,
    },
    /// Local status moved to match the processor.
    StatusSynced {
        tenant_id: String,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Processor subscription attached to a record after checkout.
    SubscriptionLinked {
        tenant_id: String,
        subscription_ref: String,
    },
    /// Bulk action finished.
    BulkActionRun {
        actor: String,
        kind: String,
        count: usize,
    },
    /// Expired record removed by retention cleanup.
    RecordPurged { tenant_id: String },
    /// Operator started acting as another user.
    ImpersonationStarted {
        admin_id: String,
        target_user_id: String,
    },
    /// Operator identity restored.
    ImpersonationEnded {
        admin_id: String,
        target_user_id: String,
    },
}

impl LifecycleAuditEvent {
    /// The event kind as a string for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TrialCreated { .. } => "trial_created",
            Self::TrialExtended { .. } => "trial_extended",
            Self::TrialCancelled { .. } => "trial_cancelled",
            Self::ForceExpired { .. } => "force_expired",
            Self::Reactivated { .. } => "reactivated",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::StatusSynced { .. } => "status_synced",
            Self::SubscriptionLinked { .. } => "subscription_linked",
            Self::BulkActionRun { .. } => "bulk_action_run",
            Self::RecordPurged { .. } => "record_purged",
            Self::ImpersonationStarted { .. } => "impersonation_started",
            Self::ImpersonationEnded { .. } => "impersonation_ended",
        }
    }
}

impl fmt::Display for LifecycleAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrialCreated { tenant_id, trial_ends_at } => {
                write!(f, "Trial created: tenant={}, ends={}", tenant_id, trial_ends_at)
            }
            Self::TrialExtended { tenant_id, actor, days, trial_ends_at } => {
                write!(
                    f,
                    "Trial extended: tenant={}, by={}, days={}, ends={}",
                    tenant_id, actor, days, trial_ends_at
                )
            }
            Self::TrialCancelled { tenant_id, actor } => {
                write!(f, "Trial cancelled: tenant={}, by={}", tenant_id, actor)
            }
            Self::ForceExpired { tenant_id, actor, previous } => {
                write!(f, "Force expired: tenant={}, by={}, was={}", tenant_id, actor, previous)
            }
            Self::Reactivated { tenant_id, actor, previous } => {
                write!(f, "Reactivated locally: tenant={}, by={}, was={}", tenant_id, actor, previous)
            }
            Self::SubscriptionCancelled { tenant_id, actor, access_until } => match access_until {
                Some(until) => write!(
                    f,
                    "Subscription cancelled: tenant={}, by={}, access_until={}",
                    tenant_id, actor, until
                ),
                None => write!(f, "Subscription cancelled: tenant={}, by={}", tenant_id, actor),
            },
            Self::StatusSynced { tenant_id, from, to } => {
                write!(f, "Status synced: tenant={}, {} -> {}", tenant_id, from, to)
            }
            Self::SubscriptionLinked { tenant_id, subscription_ref } => {
                write!(f, "Subscription linked: tenant={}, ref={}", tenant_id, subscription_ref)
            }
            Self::BulkActionRun { actor, kind, count } => {
                write!(f, "Bulk action: kind={}, by={}, count={}", kind, actor, count)
            }
            Self::RecordPurged { tenant_id } => {
                write!(f, "Expired record purged: tenant={}", tenant_id)
            }
            Self::ImpersonationStarted { admin_id, target_user_id } => {
                write!(f, "Impersonation started: admin={}, target={}", admin_id, target_user_id)
            }
            Self::ImpersonationEnded { admin_id, target_user_id } => {
                write!(f, "Impersonation ended: admin={}, target={}", admin_id, target_user_id)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should handle their own failures so that lifecycle
/// operations are never disrupted by the audit trail.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(&self, event: LifecycleAuditEvent);
}

/// Audit logger that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl AuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: LifecycleAuditEvent) {}
}

/// Logs audit events through `tracing` at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: LifecycleAuditEvent) {
        tracing::info!(
            target: "subscription.audit",
            event_type = %event.kind(),
            "{}", event
        );
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Audit logger that captures events.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<LifecycleAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<LifecycleAuditEvent> {
            self.events.lock().await.clone()
        }

        /// Kinds of the captured events, in order.
        pub async fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().await.iter().map(|e| e.kind()).collect()
        }
    }

    #[async_trait]
    impl AuditLogger for RecordingAuditLogger {
        async fn log(&self, event: LifecycleAuditEvent) {
            self.events.lock().await.push(event);
        }
    }
}
