//! Caller extraction, page-load access enforcement and impersonation tracking.

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, RawPathParams, Request, State},
    http::{StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use std::convert::Infallible;

use crate::error::GateError;
use crate::subscription::{AccessContext, AccessDecision, AccessGate, ImpersonationManager, Surface};
use crate::traits::auth::Caller;

/// Path parameter naming the tenant that owns a public booking form.
pub const OWNER_TENANT_PARAM: &str = "tenant_id";

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .cloned()
            .ok_or_else(|| GateError::unauthorized("authentication required"))
    }
}

impl<S> OptionalFromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Caller>().cloned())
    }
}

/// State for [`require_access`]: the gate and the surface it protects.
#[derive(Clone)]
pub struct AccessGuard {
    gate: AccessGate,
    surface: Surface,
}

impl AccessGuard {
    pub fn new(gate: AccessGate, surface: Surface) -> Self {
        Self { gate, surface }
    }
}

/// Middleware enforcing page-load access for one surface.
///
/// Denied page loads are redirected to the configured subscription page.
/// Denied booking forms render the unavailable message instead, since the
/// visitor cannot act on the owner's subscription. Booking-form routes must
/// carry the owner in a `{tenant_id}` path parameter; apply with `route_layer`.
///
/// # Example
///
/// ```rust,ignore
/// use axum::{Router, middleware::from_fn_with_state, routing::get};
///
/// let dashboard = Router::new()
///     .route("/dashboard", get(dashboard))
///     .route_layer(from_fn_with_state(
///         AccessGuard::new(engine.gate.clone(), Surface::Dashboard),
///         require_access,
///     ));
/// ```
pub async fn require_access(State(guard): State<AccessGuard>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let context = if guard.surface == Surface::PublicBookingForm {
        let owner = <RawPathParams as FromRequestParts<()>>::from_request_parts(&mut parts, &())
            .await
            .ok()
            .and_then(|params| {
                params
                    .iter()
                    .find(|(name, _)| *name == OWNER_TENANT_PARAM)
                    .map(|(_, value)| value.to_string())
            });
        AccessContext {
            is_operator: false,
            tenant_id: owner,
            surface: guard.surface,
        }
    } else {
        let caller = parts
            .extensions
            .get::<Caller>()
            .cloned()
            .unwrap_or_else(Caller::anonymous);
        AccessContext::for_caller(&caller, guard.surface)
    };

    match guard.gate.evaluate(&context).await {
        AccessDecision::Allow => next.run(Request::from_parts(parts, body)).await,
        AccessDecision::DenyRedirect(target) => {
            if guard.surface == Surface::PublicBookingForm {
                let message = guard.gate.denial_message(guard.surface, &target);
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            } else {
                Redirect::to(&target).into_response()
            }
        }
    }
}

/// Middleware attaching the live [`ImpersonationSession`](crate::subscription::ImpersonationSession)
/// of the caller, if any, to the request extensions.
///
/// Downstream handlers can then tell that an operator is acting as the caller.
pub async fn track_impersonation(
    State(manager): State<ImpersonationManager>,
    mut request: Request,
    next: Next,
) -> Response {
    let user_id = request
        .extensions()
        .get::<Caller>()
        .map(|caller| caller.user_id.clone())
        .filter(|id| !id.is_empty());

    if let Some(user_id) = user_id {
        match manager.session(&user_id).await {
            Ok(Some(session)) => {
                tracing::debug!(
                    target: "subscription.impersonation",
                    admin_id = %session.admin_id,
                    target_user_id = %user_id,
                    "Request made under impersonation"
                );
                request.extensions_mut().insert(session);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                target: "subscription.impersonation",
                target_user_id = %user_id,
                error = %e,
                "Could not read impersonation session"
            ),
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::subscription::{
        AccessConfig, InMemorySubscriptionStore, StatusResolver, SubscriptionRecord,
        SubscriptionStore,
    };
    use axum::{Router, body::Body, middleware::from_fn_with_state, routing::get};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn gate_with(tenant_id: &str, trial_days: i64, clock: &ManualClock) -> AccessGate {
        let store = InMemorySubscriptionStore::new();
        let record =
            SubscriptionRecord::new_trial(tenant_id, clock.now(), chrono::Duration::days(trial_days));
        store.insert(&record).await.unwrap();
        AccessGate::new(
            Arc::new(store),
            StatusResolver::default(),
            Arc::new(clock.clone()),
            AccessConfig {
                fail_open: false,
                ..AccessConfig::default()
            },
        )
    }

    fn request(uri: &str, caller: Option<Caller>) -> Request {
        let mut request = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        if let Some(caller) = caller {
            request.extensions_mut().insert(caller);
        }
        request
    }

    #[tokio::test]
    async fn test_expired_dashboard_redirects() {
        let clock = ManualClock::default();
        let gate = gate_with("tenant_1", 1, &clock).await;
        clock.advance(chrono::Duration::days(2));

        let app = Router::new()
            .route("/dashboard", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(
                AccessGuard::new(gate, Surface::Dashboard),
                require_access,
            ));

        let response = app
            .clone()
            .oneshot(request("/dashboard", Some(Caller::tenant("u1", "tenant_1"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()["location"],
            "/dashboard/subscription/?expired=1"
        );

        let response = app
            .oneshot(request("/dashboard", Some(Caller::operator("admin"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_booking_form_uses_owner_subscription() {
        let clock = ManualClock::default();
        let gate = gate_with("tenant_1", 1, &clock).await;

        let app = Router::new()
            .route("/book/{tenant_id}", get(|| async { "form" }))
            .route_layer(from_fn_with_state(
                AccessGuard::new(gate, Surface::PublicBookingForm),
                require_access,
            ));

        let response = app.clone().oneshot(request("/book/tenant_1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        clock.advance(chrono::Duration::days(2));
        let response = app.oneshot(request("/book/tenant_1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("temporarily unavailable"));
    }
}
