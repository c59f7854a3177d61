//! 路由注册
//! 每组路由挂一个安全管道，各组只在策略链上不同

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{
    auth::middleware::{security_middleware, Guard},
    handlers,
    middleware::{request_tracking_middleware, AppState},
    models::identity::Role,
    services::policy_service::Policy,
};

/// multipart 的边界与字段头开销
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    let guarded = |policies: Vec<Policy>| {
        from_fn_with_state(Guard::new(&state, policies), security_middleware)
    };

    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 会话（只需认证）
    let session_routes = Router::new()
        .route("/api/v1/auth/me", get(handlers::security::current_identity))
        .route("/api/v1/auth/logout", post(handlers::security::logout))
        .route(
            "/api/v1/auth/refresh-token",
            post(handlers::security::refresh_token),
        )
        .route_layer(guarded(Vec::new()));

    // 本人数据权利（只需认证，始终作用于调用方自己）
    let privacy_routes = Router::new()
        .route("/api/v1/privacy/export-data", get(handlers::privacy::export_data))
        .route(
            "/api/v1/privacy/deletion-eligibility",
            get(handlers::privacy::deletion_eligibility),
        )
        .route(
            "/api/v1/privacy/request-deletion",
            post(handlers::privacy::request_deletion),
        )
        .route(
            "/api/v1/privacy/confirm-deletion",
            post(handlers::privacy::confirm_deletion),
        )
        .route(
            "/api/v1/privacy/anonymize-account",
            post(handlers::privacy::anonymize_account),
        )
        .route_layer(guarded(Vec::new()));

    // 管理员安全操作
    let admin_routes = Router::new()
        .route(
            "/api/v1/admin/security/metrics",
            get(handlers::security::security_metrics),
        )
        .route(
            "/api/v1/admin/security/clear-ip",
            post(handlers::security::clear_suspicious_ip),
        )
        .route(
            "/api/v1/admin/security/revoke-session",
            post(handlers::security::revoke_session),
        )
        .route_layer(guarded(vec![Policy::RequireRole(vec![Role::Admin])]));

    // 审计查询
    let audit_routes = Router::new()
        .route("/api/v1/audit/logs", get(handlers::audit::list_audit_logs))
        .route("/api/v1/audit/dashboard", get(handlers::audit::dashboard))
        .route(
            "/api/v1/audit/security/recent",
            get(handlers::audit::recent_security_events),
        )
        .route(
            "/api/v1/audit/security/failed-logins",
            get(handlers::audit::failed_logins),
        )
        .route(
            "/api/v1/audit/security/suspicious",
            get(handlers::audit::suspicious_activities),
        )
        .route(
            "/api/v1/audit/users/{id}/timeline",
            get(handlers::audit::user_timeline),
        )
        .route_layer(guarded(vec![Policy::RequireRole(vec![Role::Admin])]));

    // 用户资料（隐私过滤）
    let profile_routes = Router::new()
        .route("/api/v1/users/{id}/profile", get(handlers::profile::get_profile))
        .route_layer(guarded(vec![Policy::AntiFraudGuard]));

    // 订单授权
    let order_routes = Router::new()
        .route("/api/v1/orders/authorize", post(handlers::orders::authorize_order))
        .route_layer(guarded(vec![
            Policy::TrustedBuyerOnly {
                threshold: state.config.security.trusted_buyer_threshold,
            },
            Policy::AntiFraudGuard,
            Policy::AdminReadOnly,
        ]));

    // 上传
    let upload_limit = (state.config.upload.max_size_bytes as usize)
        .saturating_mul(state.config.upload.max_files_per_request)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let product_upload_routes = Router::new()
        .route(
            "/api/v1/uploads/products",
            post(handlers::upload::upload_product_images),
        )
        .route_layer(guarded(vec![
            Policy::VerifiedFarmerOnly,
            Policy::AntiFraudGuard,
            Policy::AdminReadOnly,
        ]));

    let profile_upload_routes = Router::new()
        .route(
            "/api/v1/uploads/profile",
            post(handlers::upload::upload_profile_image),
        )
        .route_layer(guarded(vec![Policy::AntiFraudGuard, Policy::AdminReadOnly]));

    let upload_routes = Router::new()
        .merge(product_upload_routes)
        .merge(profile_upload_routes)
        .layer(DefaultBodyLimit::max(upload_limit));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(session_routes)
        .merge(privacy_routes)
        .merge(admin_routes)
        .merge(audit_routes)
        .merge(profile_routes)
        .merge(order_routes)
        .merge(upload_routes)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_tracking_middleware))
        .with_state(state)
}
