//! Short-lived operator impersonation.
//!
//! An operator can act as a tenant user for support. The session is keyed by
//! the target user, stored in an [`ExpiringStore`] with a fixed TTL, and checked
//! against the clock on every read. Nothing sweeps expired sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::error::{Result, SubscriptionError};
use crate::audit::{AuditLogger, LifecycleAuditEvent};
use crate::clock::Clock;
use crate::traits::auth::AuthContext;
use crate::traits::expiring::ExpiringStore;

/// Default session lifetime.
pub const DEFAULT_IMPERSONATION_TTL: Duration = Duration::from_secs(3600);

const KEY_PREFIX: &str = "impersonation:";

/// An operator acting as another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonationSession {
    pub admin_id: String,
    pub target_user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ImpersonationSession {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of [`ImpersonationManager::end`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EndImpersonation {
    /// The operator's own identity is back in effect.
    Restored { admin_id: String },
    /// There was no live session for the target.
    NoSession,
}

/// Starts, reads and ends impersonation sessions.
#[derive(Clone)]
pub struct ImpersonationManager {
    store: Arc<dyn ExpiringStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLogger>,
    ttl: Duration,
}

impl ImpersonationManager {
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditLogger>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            ttl,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start acting as `target_user_id`. Overwrites any existing session for the target.
    pub async fn start(&self, actor: &dyn AuthContext, target_user_id: &str) -> Result<ImpersonationSession> {
        if !actor.is_operator() {
            return Err(SubscriptionError::PermissionDenied {
                action: "impersonate users".to_string(),
            });
        }
        if target_user_id.trim().is_empty() {
            return Err(SubscriptionError::InvalidArgument {
                message: "impersonation target is required".to_string(),
            });
        }
        if target_user_id == actor.user_id() {
            return Err(SubscriptionError::InvalidArgument {
                message: "cannot impersonate yourself".to_string(),
            });
        }

        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl).map_err(|_| SubscriptionError::InvalidArgument {
            message: "impersonation TTL is out of range".to_string(),
        })?;
        let session = ImpersonationSession {
            admin_id: actor.user_id().to_string(),
            target_user_id: target_user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        let bytes = serde_json::to_vec(&session).map_err(|e| SubscriptionError::Storage {
            message: format!("failed to serialize impersonation session: {}", e),
        })?;
        self.store.set_bytes(&key(target_user_id), bytes, self.ttl).await?;

        tracing::info!(
            target: "subscription.impersonation.started",
            admin_id = %session.admin_id,
            target_user_id = %target_user_id,
            expires_at = %session.expires_at,
            "Impersonation session started"
        );
        self.audit
            .log(LifecycleAuditEvent::ImpersonationStarted {
                admin_id: session.admin_id.clone(),
                target_user_id: target_user_id.to_string(),
            })
            .await;

        Ok(session)
    }

    /// The live session for `target_user_id`, if any.
    pub async fn session(&self, target_user_id: &str) -> Result<Option<ImpersonationSession>> {
        let Some(bytes) = self.store.get_bytes(&key(target_user_id)).await? else {
            return Ok(None);
        };
        let session: ImpersonationSession =
            serde_json::from_slice(&bytes).map_err(|e| SubscriptionError::Storage {
                message: format!("corrupt impersonation session: {}", e),
            })?;

        if session.is_expired(self.clock.now()) {
            tracing::debug!(
                target: "subscription.impersonation.expired",
                admin_id = %session.admin_id,
                target_user_id = %target_user_id,
                "Ignoring expired impersonation session"
            );
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Restore the operator behind a live session and drop the session.
    ///
    /// Missing or expired sessions are a no-op.
    pub async fn end(&self, target_user_id: &str) -> Result<EndImpersonation> {
        let session = self.session(target_user_id).await?;
        self.store.delete(&key(target_user_id)).await?;

        let Some(session) = session else {
            return Ok(EndImpersonation::NoSession);
        };

        tracing::info!(
            target: "subscription.impersonation.ended",
            admin_id = %session.admin_id,
            target_user_id = %target_user_id,
            "Impersonation session ended"
        );
        self.audit
            .log(LifecycleAuditEvent::ImpersonationEnded {
                admin_id: session.admin_id.clone(),
                target_user_id: target_user_id.to_string(),
            })
            .await;

        Ok(EndImpersonation::Restored {
            admin_id: session.admin_id,
        })
    }
}

fn key(target_user_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, target_user_id)
}
