//! 策略与请求完整性集成测试

use axum::{body::Body, http::StatusCode};
use market_guard::models::{audit::AuditEventType, identity::Role};
use serde_json::json;

mod common;
use common::{assert_denial, authed, json_body, send, TestApp, TestUser};

fn order(token: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    authed("POST", "/api/v1/orders/authorize", token, "203.0.113.20")
        .header("content-type", "application/json")
        .body(json_body(&body))
        .unwrap()
}

#[tokio::test]
async fn test_low_trust_buyer_bulk_order_is_denied() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(40));
    let token = app.token_for(buyer, Role::Buyer);

    let request = order(&token, json!({ "price": 1000, "quantity": 60 }));
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "POLICY_VIOLATION");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("70"), "message: {}", message);
    assert!(message.contains("40"), "message: {}", message);

    let violations = app.events_of(AuditEventType::PolicyViolation).await;
    assert_eq!(violations.len(), 1);
    match &violations[0].details {
        market_guard::models::audit::AuditDetails::Authorization { policy, .. } => {
            assert_eq!(policy, "TrustedBuyerOnly")
        }
        other => panic!("unexpected details: {:?}", other),
    }
}

#[tokio::test]
async fn test_small_orders_and_trusted_buyers_pass() {
    let app = TestApp::new();
    let router = app.router();

    let low = app.add_user(TestUser::buyer(40));
    let token = app.token_for(low, Role::Buyer);
    let (status, _, body) =
        send(&router, order(&token, json!({ "price": 100, "quantity": 10 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authorized"], true);
    assert_eq!(body["orderValue"], 1000.0);

    let trusted = app.add_user(TestUser::buyer(85));
    let token = app.token_for(trusted, Role::Buyer);
    let (status, _, body) =
        send(&router, order(&token, json!({ "price": 1000, "quantity": 60 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orderValue"], 60000.0);
}

#[tokio::test]
async fn test_high_risk_account_is_blocked_by_anti_fraud() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(90).high_risk());
    let token = app.token_for(buyer, Role::Buyer);

    let (status, _, body) =
        send(&router, order(&token, json!({ "price": 10, "quantity": 1 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "POLICY_VIOLATION");
}

#[tokio::test]
async fn test_admin_cannot_write_marketplace_routes() {
    let app = TestApp::new();
    let router = app.router();
    let admin = app.add_user(TestUser::admin().high_risk());
    let token = app.token_for(admin, Role::Admin);

    // 管理员绕过反欺诈，但不能绕过只读限制
    let (status, _, body) =
        send(&router, order(&token, json!({ "price": 10, "quantity": 1 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "INSUFFICIENT_PERMISSIONS");

    let denied = app.events_of(AuditEventType::AccessDenied).await;
    assert_eq!(denied.len(), 1);
}

#[tokio::test]
async fn test_audit_routes_require_admin_role() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let admin = app.add_user(TestUser::admin());

    let token = app.token_for(farmer, Role::Farmer);
    let request = authed("GET", "/api/v1/audit/logs", &token, "203.0.113.21")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "INSUFFICIENT_PERMISSIONS");

    let token = app.token_for(admin, Role::Admin);
    let request = authed(
        "GET",
        "/api/v1/audit/logs?eventType=ACCESS_DENIED&page=1&limit=10",
        &token,
        "203.0.113.22",
    )
    .body(Body::empty())
    .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["page"], 1);
    assert_eq!(body["data"]["logs"][0]["eventType"], "ACCESS_DENIED");

    let request = authed("GET", "/api/v1/audit/dashboard?hours=24", &token, "203.0.113.22")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["totalEvents"].as_u64().unwrap() >= 3);

    let request = authed(
        "GET",
        &format!("/api/v1/audit/users/{}/timeline", farmer),
        &token,
        "203.0.113.22",
    )
    .body(Body::empty())
    .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["count"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_failed_logins_grouped_by_ip() {
    let app = TestApp::new();
    let router = app.router();
    let admin = app.add_user(TestUser::admin());
    let token = app.token_for(admin, Role::Admin);

    for _ in 0..3 {
        let request = authed("GET", "/api/v1/auth/me", "bad-token", "198.51.100.77")
            .body(Body::empty())
            .unwrap();
        send(&router, request).await;
    }

    let request = authed("GET", "/api/v1/audit/security/failed-logins", &token, "203.0.113.23")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    let groups = body["data"].as_array().unwrap();
    let group = groups
        .iter()
        .find(|g| g["ipAddress"] == "198.51.100.77")
        .expect("group for failing ip");
    assert_eq!(group["attempts"], 3);
}

#[tokio::test]
async fn test_injection_patterns_are_rejected() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(90));
    let token = app.token_for(buyer, Role::Buyer);

    let request = order(
        &token,
        json!({ "price": 10, "quantity": 1, "note": "<script>alert(1)</script>" }),
    );
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "MALICIOUS_INPUT");
    assert_eq!(app.events_of(AuditEventType::XssAttempt).await.len(), 1);

    let request = authed(
        "GET",
        "/api/v1/auth/me?q=1%20UNION%20SELECT%20password",
        &token,
        "203.0.113.20",
    )
    .body(Body::empty())
    .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "MALICIOUS_INPUT");
    assert_eq!(app.events_of(AuditEventType::InjectionAttempt).await.len(), 1);
}

#[tokio::test]
async fn test_unverified_farmer_cannot_upload_products() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer().unverified());
    let token = app.token_for(farmer, Role::Farmer);

    let request = authed("POST", "/api/v1/uploads/products", &token, "203.0.113.24")
        .header("content-type", "multipart/form-data; boundary=xyz")
        .body(Body::from("--xyz--\r\n"))
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "INSUFFICIENT_PERMISSIONS");
}

#[tokio::test]
async fn test_body_inspected_regardless_of_content_type_spelling() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(40));
    let token = app.token_for(buyer, Role::Buyer);

    let with_type = |content_type: &str, body: serde_json::Value| {
        authed("POST", "/api/v1/orders/authorize", &token, "203.0.113.25")
            .header("content-type", content_type)
            .body(json_body(&body))
            .unwrap()
    };

    for content_type in ["application/vnd.api+json", "Application/JSON"] {
        let (status, _, body) = send(
            &router,
            with_type(content_type, json!({ "price": 1000, "quantity": 60 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN, "content-type: {}", content_type);
        assert_denial(&body, "POLICY_VIOLATION");
    }
    assert_eq!(app.events_of(AuditEventType::PolicyViolation).await.len(), 2);

    let (status, _, body) = send(
        &router,
        with_type(
            "application/problem+json",
            json!({ "price": 10, "quantity": 1, "note": "<script>alert(1)</script>" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "MALICIOUS_INPUT");

    // 非 JSON 的请求体按文本检查
    let request = authed("POST", "/api/v1/orders/authorize", &token, "203.0.113.25")
        .header("content-type", "text/plain")
        .body(Body::from("note=<script>alert(1)</script>"))
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "MALICIOUS_INPUT");
    assert_eq!(app.events_of(AuditEventType::XssAttempt).await.len(), 2);
}

#[tokio::test]
async fn test_extractor_rejections_use_error_envelope() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(90));
    let admin = app.add_user(TestUser::admin());
    let token = app.token_for(buyer, Role::Buyer);

    let request = authed("POST", "/api/v1/orders/authorize", &token, "203.0.113.26")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, headers, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "BAD_REQUEST");
    assert_eq!(
        body["requestId"].as_str(),
        headers.get("x-request-id").and_then(|v| v.to_str().ok())
    );

    let request = authed("POST", "/api/v1/orders/authorize", &token, "203.0.113.26")
        .body(Body::from(r#"{"price": 10, "quantity": 1}"#))
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "BAD_REQUEST");

    let token = app.token_for(admin, Role::Admin);
    let request = authed(
        "GET",
        "/api/v1/audit/users/not-a-uuid/timeline",
        &token,
        "203.0.113.27",
    )
    .body(Body::empty())
    .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "BAD_REQUEST");
}

#[tokio::test]
async fn test_admin_allowlist_requires_path_boundary() {
    let app = TestApp::with_config(|config| {
        config.security.admin_write_allowlist = vec!["/api/v1/orders".to_string()];
    });
    let router = app.router();
    let admin = app.add_user(TestUser::admin());
    let token = app.token_for(admin, Role::Admin);

    // /api/v1/orders/authorize 位于放行前缀之下
    let (status, _, _) =
        send(&router, order(&token, json!({ "price": 10, "quantity": 1 }))).await;
    assert_eq!(status, StatusCode::OK);

    let app = TestApp::with_config(|config| {
        config.security.admin_write_allowlist = vec!["/api/v1/ord".to_string()];
    });
    let router = app.router();
    let admin = app.add_user(TestUser::admin());
    let token = app.token_for(admin, Role::Admin);

    let (status, _, body) =
        send(&router, order(&token, json!({ "price": 10, "quantity": 1 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_denial(&body, "INSUFFICIENT_PERMISSIONS");
}
