//! 文件上传集成测试
//! multipart 请求体手工拼装

use axum::{body::Body, http::StatusCode};
use market_guard::models::{audit::AuditEventType, identity::Role};
use std::path::Path;

mod common;
use common::{assert_denial, authed, send, TestApp, TestUser};

const BOUNDARY: &str = "market-guard-boundary";

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

fn png_bytes() -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.resize(2048, 0);
    bytes
}

fn multipart_body(files: &[(&str, &str, Vec<u8>)]) -> Body {
    let mut body = Vec::new();
    for (filename, content_type, bytes) in files {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"images\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Body::from(body)
}

fn upload_request(uri: &str, token: &str, files: &[(&str, &str, Vec<u8>)]) -> axum::http::Request<Body> {
    authed("POST", uri, token, "203.0.113.60")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(multipart_body(files))
        .unwrap()
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_valid_png_is_stored_under_secure_name() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let token = app.token_for(farmer, Role::Farmer);

    let request = upload_request(
        "/api/v1/uploads/products",
        &token,
        &[("tomatoes.png", "image/png", png_bytes())],
    );
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["target"], "products");
    assert_eq!(body["count"], 1);

    let file = &body["files"][0];
    assert_eq!(file["originalName"], "tomatoes.png");
    assert_eq!(file["size"], 2048);
    assert!(file.get("storagePath").is_none());

    let secure_name = file["secureFilename"].as_str().unwrap();
    assert!(secure_name.ends_with(".png"));
    assert!(!secure_name.contains("tomatoes"));

    let products_dir = &app.state.config.upload.products_dir;
    assert!(products_dir.join(secure_name).exists());
    assert_eq!(file_count(&app.state.config.upload.temp_dir), 0);
    assert_eq!(app.events_of(AuditEventType::FileUploadSuccess).await.len(), 1);
}

#[tokio::test]
async fn test_executable_disguised_as_png_is_rejected() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let token = app.token_for(farmer, Role::Farmer);

    let mut payload = vec![0x4D, 0x5A, 0x90, 0x00];
    payload.resize(2048, 0);

    let request = upload_request(
        "/api/v1/uploads/products",
        &token,
        &[("photo.png", "image/png", payload)],
    );
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "FILE_VALIDATION_FAILED");
    assert_eq!(file_count(&app.state.config.upload.temp_dir), 0);
    assert_eq!(file_count(&app.state.config.upload.products_dir), 0);
    assert_eq!(app.events_of(AuditEventType::FileValidationFailed).await.len(), 1);
    assert_eq!(app.events_of(AuditEventType::MaliciousFileUpload).await.len(), 1);
    assert!(body["message"]
        .as_str()
        .map_or(false, |m| m.contains("windows executable")));
}

#[tokio::test]
async fn test_embedded_script_raises_malicious_upload_alert() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let token = app.token_for(farmer, Role::Farmer);

    let mut payload = png_bytes();
    payload[100..120].copy_from_slice(b"<?php system($x); ?>");

    let request = upload_request(
        "/api/v1/uploads/products",
        &token,
        &[("harvest.png", "image/png", payload)],
    );
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "FILE_VALIDATION_FAILED");
    assert_eq!(app.events_of(AuditEventType::FileValidationFailed).await.len(), 1);
    assert_eq!(app.events_of(AuditEventType::MaliciousFileUpload).await.len(), 1);
}

#[tokio::test]
async fn test_failed_file_rolls_back_whole_request() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let token = app.token_for(farmer, Role::Farmer);

    let request = upload_request(
        "/api/v1/uploads/products",
        &token,
        &[
            ("first.png", "image/png", png_bytes()),
            ("second.exe", "application/octet-stream", png_bytes()),
        ],
    );
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_denial(&body, "FILE_VALIDATION_FAILED");
    assert_eq!(file_count(&app.state.config.upload.products_dir), 0);
    assert_eq!(file_count(&app.state.config.upload.temp_dir), 0);
}

#[tokio::test]
async fn test_upload_rate_limit_per_user() {
    let app = TestApp::new();
    let router = app.router();
    let buyer = app.add_user(TestUser::buyer(60));
    let token = app.token_for(buyer, Role::Buyer);

    for i in 0..10 {
        let request = upload_request(
            "/api/v1/uploads/profile",
            &token,
            &[("avatar.png", "image/png", png_bytes())],
        );
        let (status, _, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK, "upload {} failed: {}", i + 1, body);
    }

    let request = upload_request(
        "/api/v1/uploads/profile",
        &token,
        &[("avatar.png", "image/png", png_bytes())],
    );
    let (status, headers, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_denial(&body, "RATE_LIMIT_EXCEEDED");
    assert!(headers.contains_key("retry-after"));
    assert_eq!(file_count(&app.state.config.upload.profiles_dir), 10);
}

#[tokio::test]
async fn test_request_without_files_is_bad_request() {
    let app = TestApp::new();
    let router = app.router();
    let farmer = app.add_user(TestUser::farmer());
    let token = app.token_for(farmer, Role::Farmer);

    let request = upload_request("/api/v1/uploads/products", &token, &[]);
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}
