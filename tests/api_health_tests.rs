//! 健康检查端点集成测试

use axum::{body::Body, http::Request, http::StatusCode};

mod common;
use common::{send, TestApp};

#[tokio::test]
async fn test_health_check_needs_no_token() {
    let app = TestApp::new();
    let router = app.router();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_readiness_without_database() {
    let app = TestApp::new();
    let router = app.router();

    let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    let checks = body["checks"].as_array().unwrap();
    let database = checks.iter().find(|c| c["name"] == "database").unwrap();
    assert_eq!(database["status"], "detached");
    let fallback = checks.iter().find(|c| c["name"] == "audit_fallback").unwrap();
    assert_eq!(fallback["status"], "healthy");
}
