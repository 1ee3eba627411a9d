use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::middleware::track_impersonation;
use crate::app::SubscriptionEngine;
use crate::error::{GateError, Result};
use crate::subscription::{
    AccessCheck, AccessContext, BatchReport, BulkActionKind, BulkActionResult, CancelResult,
    EndImpersonation, HealthReport, ImpersonationSession, Surface, SubscriptionAnalytics,
    SubscriptionRecord, SyncResult, TRIAL_CANCELLED_MESSAGE, WebhookOutcome,
};
use crate::traits::auth::{AuthContext, Caller};

/// The subscription HTTP surface with the engine applied as state.
///
/// Callers are read from request extensions; put the authentication layer
/// that inserts [`Caller`] in front of this router. The processor webhook
/// route authenticates by signature and needs no caller.
pub fn routes(engine: SubscriptionEngine) -> Router {
    let impersonation = engine.impersonation.clone();

    Router::new()
        .route("/access/{tenant_id}", get(check_access))
        .route("/subscriptions/{tenant_id}/cancel", post(cancel_subscription))
        .route("/subscriptions/{tenant_id}/cancel-trial", post(cancel_trial))
        .route("/subscriptions/{tenant_id}/checkout", post(checkout))
        .route("/subscriptions/{tenant_id}/portal", post(portal))
        .route("/admin/sync", post(sync_all))
        .route("/admin/tenants/{tenant_id}/sync", post(sync_tenant))
        .route("/admin/tenants/{tenant_id}/link", post(link_subscription))
        .route("/admin/bulk/{kind}", post(bulk_action))
        .route("/admin/tenants/{tenant_id}/extend-trial", post(extend_trial))
        .route("/admin/tenants/{tenant_id}/force-expire", post(force_expire))
        .route("/admin/tenants/{tenant_id}/reactivate", post(reactivate))
        .route(
            "/admin/impersonation/{target_id}",
            post(start_impersonation).delete(end_impersonation),
        )
        .route("/admin/analytics", get(analytics))
        .route("/admin/health", get(health))
        .route("/webhooks/processor", post(processor_webhook))
        .layer(from_fn_with_state(impersonation, track_impersonation))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    pub surface: Option<Surface>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendTrialRequest {
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub subscription_ref: String,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SyncFailureResponse {
    pub tenant_id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct BatchReportResponse {
    pub succeeded: usize,
    pub changed: usize,
    pub failed: Vec<SyncFailureResponse>,
}

impl From<BatchReport> for BatchReportResponse {
    fn from(report: BatchReport) -> Self {
        Self {
            succeeded: report.succeeded,
            changed: report.changed,
            failed: report
                .failed
                .into_iter()
                .map(|f| SyncFailureResponse {
                    tenant_id: f.tenant_id,
                    error: f.error.user_message(),
                })
                .collect(),
        }
    }
}

fn require_operator(caller: &Caller) -> Result<()> {
    if caller.is_operator() {
        Ok(())
    } else {
        Err(GateError::forbidden("operator access required"))
    }
}

async fn check_access(
    State(engine): State<SubscriptionEngine>,
    caller: Option<Caller>,
    Path(tenant_id): Path<String>,
    Query(query): Query<AccessQuery>,
) -> Json<AccessCheck> {
    let surface = query.surface.unwrap_or(Surface::Dashboard);
    let context = AccessContext {
        is_operator: caller.as_ref().is_some_and(|c| c.is_operator()),
        tenant_id: Some(tenant_id),
        surface,
    };
    Json(engine.gate.check_access_on(&context).await)
}

async fn cancel_subscription(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<CancelResult>> {
    Ok(Json(engine.admin.cancel_subscription(&caller, &tenant_id).await?))
}

async fn cancel_trial(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<MessageResponse>> {
    engine.admin.cancel_trial(&caller, &tenant_id).await?;
    Ok(Json(MessageResponse {
        ok: true,
        message: TRIAL_CANCELLED_MESSAGE.to_string(),
    }))
}

async fn checkout(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<UrlResponse>> {
    let url = engine.admin.create_checkout_url(&caller, &tenant_id).await?;
    Ok(Json(UrlResponse { url }))
}

async fn portal(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<UrlResponse>> {
    let url = engine.admin.create_portal_url(&caller, &tenant_id).await?;
    Ok(Json(UrlResponse { url }))
}

async fn sync_all(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
) -> Result<Json<BatchReportResponse>> {
    require_operator(&caller)?;
    let report = engine.sync.sync_all_known().await?;
    Ok(Json(report.into()))
}

async fn sync_tenant(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<SyncResult>> {
    require_operator(&caller)?;
    Ok(Json(engine.sync.sync(&tenant_id).await?))
}

async fn link_subscription(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
    Json(body): Json<LinkRequest>,
) -> Result<Json<SyncResult>> {
    require_operator(&caller)?;
    Ok(Json(engine.sync.link(&tenant_id, &body.subscription_ref).await?))
}

async fn bulk_action(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(kind): Path<String>,
) -> Result<Json<BulkActionResult>> {
    let kind: BulkActionKind = kind.parse()?;
    Ok(Json(engine.admin.bulk_action(&caller, kind).await?))
}

async fn extend_trial(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
    Json(body): Json<ExtendTrialRequest>,
) -> Result<Json<SubscriptionRecord>> {
    Ok(Json(
        engine
            .admin
            .extend_trial(&caller, &tenant_id, body.days)
            .await?,
    ))
}

async fn force_expire(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<SubscriptionRecord>> {
    Ok(Json(engine.admin.force_expire(&caller, &tenant_id).await?))
}

async fn reactivate(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(tenant_id): Path<String>,
) -> Result<Json<SubscriptionRecord>> {
    Ok(Json(engine.admin.reactivate(&caller, &tenant_id).await?))
}

async fn start_impersonation(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(target_id): Path<String>,
) -> Result<Json<ImpersonationSession>> {
    Ok(Json(engine.impersonation.start(&caller, &target_id).await?))
}

/// Ends a session. Allowed for operators and for the impersonated user, who
/// is the identity in effect while the session is live.
async fn end_impersonation(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
    Path(target_id): Path<String>,
) -> Result<Json<EndImpersonation>> {
    if !caller.is_operator() && caller.user_id() != target_id {
        return Err(GateError::forbidden("cannot end another user's impersonation"));
    }
    Ok(Json(engine.impersonation.end(&target_id).await?))
}

async fn analytics(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
) -> Result<Json<SubscriptionAnalytics>> {
    require_operator(&caller)?;
    Ok(Json(engine.analytics.analytics().await?))
}

async fn health(
    State(engine): State<SubscriptionEngine>,
    caller: Caller,
) -> Result<Json<HealthReport>> {
    require_operator(&caller)?;
    Ok(Json(engine.analytics.health().await?))
}

/// Signed processor events. Needs the raw body for signature verification.
async fn processor_webhook(
    State(engine): State<SubscriptionEngine>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>> {
    let handler = engine
        .webhooks
        .as_ref()
        .ok_or_else(|| GateError::ServiceUnavailable("webhooks are not configured".to_string()))?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GateError::bad_request("missing Stripe-Signature header"))?;

    Ok(Json(handler.receive(&body, signature).await?))
}
