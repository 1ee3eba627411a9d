mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use chrono::Duration;
use common::{TestEngine, remote, sign_webhook};
use serde_json::{Value, json};
use subscription_gate::subscription::RemoteStatus;
use subscription_gate::{Caller, SubscriptionStatus};
use tower::ServiceExt;

fn app(t: &TestEngine) -> Router {
    subscription_gate::http::routes(t.engine.clone())
}

fn request(method: Method, uri: &str, caller: Option<Caller>, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let mut request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    if let Some(caller) = caller {
        request.extensions_mut().insert(caller);
    }
    request
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_access_check_reports_decision() {
    let t = TestEngine::new();
    let now = t.now();
    t.seed("live", SubscriptionStatus::Trial, Some(now + Duration::days(2)), None)
        .await;
    t.seed("lapsed", SubscriptionStatus::Expired, None, Some(now - Duration::days(1)))
        .await;

    let (status, body) = send(app(&t), request(Method::GET, "/access/live", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "allowed": true, "message": "" }));

    let (_, body) = send(
        app(&t),
        request(
            Method::GET,
            "/access/lapsed?surface=public_booking_form",
            None,
            None,
        ),
    )
    .await;
    assert_eq!(body["allowed"], false);
    assert!(body["message"].as_str().unwrap().contains("temporarily unavailable"));
}

#[tokio::test]
async fn test_admin_routes_require_an_operator() {
    let t = TestEngine::new();

    let (status, body) = send(app(&t), request(Method::POST, "/admin/sync", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error_id"].is_string());

    let tenant = Caller::tenant("u1", "tenant_1");
    let (status, _) = send(
        app(&t),
        request(Method::GET, "/admin/analytics", Some(tenant.clone()), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/tenants/tenant_1/extend-trial",
            Some(tenant),
            Some(json!({ "days": 7 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_extend_trial_route() {
    let t = TestEngine::new();
    let created = t.engine.admin.create_trial("tenant_1", None).await.unwrap();
    let operator = Caller::operator("admin");

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/tenants/tenant_1/extend-trial",
            Some(operator.clone()),
            Some(json!({ "days": 7 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "trial");
    let expected = created.trial_ends_at.unwrap() + Duration::days(7);
    assert_eq!(t.record("tenant_1").await.trial_ends_at, Some(expected));

    let (status, _) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/tenants/missing/extend-trial",
            Some(operator),
            Some(json!({ "days": 7 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_bulk_action_is_rejected() {
    let t = TestEngine::new();
    let (status, body) = send(
        app(&t),
        request(Method::POST, "/admin/bulk/nuke", Some(Caller::operator("admin")), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("nuke"));

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/bulk/extend_trials",
            Some(Caller::operator("admin")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "extend_trials");
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_batch_sync_route_reports_counts() {
    let t = TestEngine::new();
    let now = t.now();
    t.seed_linked("tenant_1", "sub_1").await;
    t.gateway
        .put(remote("sub_1", RemoteStatus::Active, now + Duration::days(30)));
    t.seed_linked("tenant_2", "sub_missing").await;

    let (status, body) = send(
        app(&t),
        request(Method::POST, "/admin/sync", Some(Caller::operator("admin")), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["changed"], 1);
    assert_eq!(body["failed"][0]["tenant_id"], "tenant_2");
    assert!(!body["failed"][0]["error"].as_str().unwrap().contains("sub_missing"));
}

#[tokio::test]
async fn test_link_route_activates_tenant() {
    let t = TestEngine::new();
    let now = t.now();
    t.engine.admin.create_trial("tenant_1", None).await.unwrap();
    t.gateway
        .put(remote("sub_new", RemoteStatus::Active, now + Duration::days(30)));

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/tenants/tenant_1/link",
            Some(Caller::operator("admin")),
            Some(json!({ "subscription_ref": "sub_new" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["status_changed"], true);
}

#[tokio::test]
async fn test_owner_gets_checkout_url_but_not_for_other_tenants() {
    let t = TestEngine::new();
    t.engine.admin.create_trial("tenant_1", None).await.unwrap();
    let owner = Caller::tenant("u1", "tenant_1");

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/subscriptions/tenant_1/checkout",
            Some(owner.clone()),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://checkout.test/tenant_1");

    let (status, _) = send(
        app(&t),
        request(Method::POST, "/subscriptions/tenant_2/checkout", Some(owner), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cancel_trial_route() {
    let t = TestEngine::new();
    t.engine.admin.create_trial("tenant_1", None).await.unwrap();

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/subscriptions/tenant_1/cancel-trial",
            Some(Caller::tenant("u1", "tenant_1")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(
        t.record("tenant_1").await.status,
        SubscriptionStatus::ExpiredTrial
    );

    let (status, _) = send(
        app(&t),
        request(
            Method::POST,
            "/subscriptions/tenant_1/cancel-trial",
            Some(Caller::tenant("u1", "tenant_1")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_impersonated_user_can_end_session() {
    let t = TestEngine::new();

    let (status, body) = send(
        app(&t),
        request(
            Method::POST,
            "/admin/impersonation/user_9",
            Some(Caller::operator("admin_1")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["admin_id"], "admin_1");

    let (status, _) = send(
        app(&t),
        request(
            Method::DELETE,
            "/admin/impersonation/user_9",
            Some(Caller::tenant("someone_else", "tenant_1")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        app(&t),
        request(
            Method::DELETE,
            "/admin/impersonation/user_9",
            Some(Caller::tenant("user_9", "tenant_1")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "outcome": "restored", "admin_id": "admin_1" }));
}

#[tokio::test]
async fn test_health_and_analytics() {
    let t = TestEngine::new();
    let now = t.now();
    t.seed("active", SubscriptionStatus::Active, None, Some(now + Duration::days(20)))
        .await;
    t.seed("trial", SubscriptionStatus::Trial, Some(now + Duration::days(5)), None)
        .await;
    let operator = Caller::operator("admin");

    let (status, body) = send(
        app(&t),
        request(Method::GET, "/admin/analytics", Some(operator.clone()), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["active"], 1);
    assert_eq!(body["conversion_rate"], 50.0);

    let (status, body) = send(
        app(&t),
        request(Method::GET, "/admin/health", Some(operator), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processor_configured"], true);
    assert_eq!(body["issues"], json!([]));
}

fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/processor")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

#[tokio::test]
async fn test_processor_webhook_links_checkout() {
    let t = TestEngine::with_webhook_secret("whsec_http");
    let now = t.now();
    t.engine.admin.create_trial("tenant_1", None).await.unwrap();
    t.gateway
        .put(remote("sub_1", RemoteStatus::Active, now + Duration::days(30)));

    let payload = json!({
        "id": "evt_checkout_1",
        "type": "checkout.session.completed",
        "data": {"object": {"client_reference_id": "tenant_1", "subscription": "sub_1"}},
        "created": now.timestamp(),
    })
    .to_string();
    let signature = sign_webhook("whsec_http", &payload, now.timestamp());

    let (status, body) = send(app(&t), webhook_request(&payload, Some(signature.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");
    assert_eq!(body["status"], "active");
    assert_eq!(t.record("tenant_1").await.status, SubscriptionStatus::Active);

    let (status, body) = send(app(&t), webhook_request(&payload, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_processed");
}

#[tokio::test]
async fn test_processor_webhook_rejects_bad_signatures() {
    let t = TestEngine::with_webhook_secret("whsec_http");
    let now = t.now().timestamp();
    let payload = r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{}}}"#;

    let (status, _) = send(app(&t), webhook_request(payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = sign_webhook("whsec_other", payload, now);
    let (status, _) = send(app(&t), webhook_request(payload, Some(forged))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let stale = sign_webhook("whsec_http", payload, now - 3600);
    let (status, _) = send(app(&t), webhook_request(payload, Some(stale))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_processor_webhook_unavailable_without_secret() {
    let t = TestEngine::new();
    let payload = r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{}}}"#;
    let signature = sign_webhook("whsec_http", payload, t.now().timestamp());

    let (status, _) = send(app(&t), webhook_request(payload, Some(signature))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
