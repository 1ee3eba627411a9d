//! The single access decision point for protected surfaces.
//!
//! Every surface asks the same question through [`AccessGate::evaluate`]. Page
//! loads turn a denial into a redirect, API callers use the boolean form.
//! Evaluation never writes to storage.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::SubscriptionError;
use super::resolver::StatusResolver;
use super::storage::SubscriptionStore;
use crate::clock::Clock;
use crate::traits::auth::AuthContext;

/// Default redirect for denied page loads.
pub const DEFAULT_REDIRECT_PATH: &str = "/dashboard/subscription/?expired=1";

/// Shown to visitors of a public booking form whose owner has lapsed.
pub const BOOKING_FORM_UNAVAILABLE_MESSAGE: &str = "This service is temporarily unavailable. \
    The business owner's plan has expired. Please contact them directly or try again later.";

/// A protected surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Dashboard,
    Registration,
    /// Governed by the subscription of the tenant that owns the form.
    PublicBookingForm,
    /// Always reachable so that lapsed tenants can pay.
    SubscriptionManagement,
}

impl Surface {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Registration => "registration",
            Self::PublicBookingForm => "public_booking_form",
            Self::SubscriptionManagement => "subscription_management",
        }
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Surface {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dashboard" => Ok(Self::Dashboard),
            "registration" => Ok(Self::Registration),
            "public_booking_form" => Ok(Self::PublicBookingForm),
            "subscription_management" => Ok(Self::SubscriptionManagement),
            other => Err(SubscriptionError::InvalidArgument {
                message: format!("unknown surface '{}'", other),
            }),
        }
    }
}

/// Who is asking, for which tenant, on which surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub is_operator: bool,
    /// The tenant whose subscription governs the request.
    pub tenant_id: Option<String>,
    pub surface: Surface,
}

impl AccessContext {
    /// Context for an authenticated caller acting for their own tenant.
    pub fn for_caller(caller: &dyn AuthContext, surface: Surface) -> Self {
        Self {
            is_operator: caller.is_operator(),
            tenant_id: caller.current_tenant_id().map(str::to_string),
            surface,
        }
    }

    /// Context for a public booking form owned by `owner_tenant_id`.
    ///
    /// The visitor's own identity is irrelevant here.
    pub fn for_booking_form(owner_tenant_id: impl Into<String>) -> Self {
        Self {
            is_operator: false,
            tenant_id: Some(owner_tenant_id.into()),
            surface: Surface::PublicBookingForm,
        }
    }

    /// Context for a tenant on a given surface.
    pub fn for_tenant(tenant_id: impl Into<String>, surface: Surface) -> Self {
        Self {
            is_operator: false,
            tenant_id: Some(tenant_id.into()),
            surface,
        }
    }
}

/// Result of [`AccessGate::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Deny and send the caller to this path.
    DenyRedirect(String),
}

impl AccessDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Boolean-shaped result with a message for the caller.
///
/// `message` is always present and empty when access is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessCheck {
    pub allowed: bool,
    pub message: String,
}

/// Access gate settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessConfig {
    /// Allow access when there is no record or the store is unavailable.
    pub fail_open: bool,
    /// Where denied page loads are sent.
    pub redirect_path: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            redirect_path: DEFAULT_REDIRECT_PATH.to_string(),
        }
    }
}

/// Authorization for every protected surface.
#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn SubscriptionStore>,
    resolver: StatusResolver,
    clock: Arc<dyn Clock>,
    config: AccessConfig,
}

impl AccessGate {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        resolver: StatusResolver,
        clock: Arc<dyn Clock>,
        config: AccessConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    /// Decide whether the request may proceed.
    pub async fn evaluate(&self, context: &AccessContext) -> AccessDecision {
        if context.is_operator || context.surface == Surface::SubscriptionManagement {
            return AccessDecision::Allow;
        }

        let Some(tenant_id) = context.tenant_id.as_deref() else {
            return self.fallback(context, "no governing tenant");
        };

        let record = match self.store.get(tenant_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return self.fallback(context, "no subscription record"),
            Err(e) => {
                tracing::error!(
                    target: "subscription.access",
                    tenant_id = %tenant_id,
                    error = %e,
                    fail_open = self.config.fail_open,
                    "Subscription store unavailable during access check"
                );
                return self.fallback(context, "store unavailable");
            }
        };

        let now = self.clock.now();
        if self.resolver.is_allowed(&record, now) {
            return AccessDecision::Allow;
        }

        tracing::debug!(
            target: "subscription.access",
            tenant_id = %tenant_id,
            surface = %context.surface,
            status = %self.resolver.resolve(&record, now),
            "Access denied"
        );
        self.deny()
    }

    /// Boolean form of [`evaluate`](Self::evaluate).
    pub async fn is_allowed(&self, context: &AccessContext) -> bool {
        self.evaluate(context).await.is_allowed()
    }

    /// Check a tenant's dashboard access.
    pub async fn check_access(&self, tenant_id: &str) -> AccessCheck {
        self.check_access_on(&AccessContext::for_tenant(tenant_id, Surface::Dashboard))
            .await
    }

    /// Check access and explain a denial in terms suited to the surface.
    pub async fn check_access_on(&self, context: &AccessContext) -> AccessCheck {
        match self.evaluate(context).await {
            AccessDecision::Allow => AccessCheck {
                allowed: true,
                message: String::new(),
            },
            AccessDecision::DenyRedirect(target) => AccessCheck {
                allowed: false,
                message: self.denial_message(context.surface, &target),
            },
        }
    }

    /// The message shown for a denial on `surface`.
    #[must_use]
    pub fn denial_message(&self, surface: Surface, target: &str) -> String {
        match surface {
            Surface::PublicBookingForm => BOOKING_FORM_UNAVAILABLE_MESSAGE.to_string(),
            _ => format!(
                "Your subscription has expired. Please renew your subscription to continue: {}",
                target
            ),
        }
    }

    fn deny(&self) -> AccessDecision {
        AccessDecision::DenyRedirect(self.config.redirect_path.clone())
    }

    fn fallback(&self, context: &AccessContext, reason: &str) -> AccessDecision {
        if self.config.fail_open {
            tracing::debug!(
                target: "subscription.access",
                surface = %context.surface,
                reason = reason,
                "Allowing access without a subscription decision"
            );
            AccessDecision::Allow
        } else {
            tracing::warn!(
                target: "subscription.access",
                surface = %context.surface,
                reason = reason,
                "Denying access without a subscription decision"
            );
            self.deny()
        }
    }
}
