//! 会话与安全状态的 HTTP 处理器

use crate::{
    auth::gate::AuthContext, error::AppError, extract::ApiJson, middleware::AppState,
};
use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct ClearIpRequest {
    pub ip: IpAddr,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionRequest {
    pub user_id: Uuid,
    /// 令牌签发时间（Unix 秒）
    #[validate(range(min = 1))]
    pub issued_at: i64,
}

/// 当前身份与安全上下文
pub async fn current_identity(auth: AuthContext) -> Result<impl IntoResponse, AppError> {
    Ok(Json(json!({
        "success": true,
        "identity": auth.identity,
        "securityContext": auth.context,
    })))
}

/// 登出：吊销当前会话
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_gate
        .revoke_session(
            auth.session.user_id,
            auth.session.issued_at,
            &auth.identity,
            &auth.context,
        )
        .await;

    Ok(Json(json!({
        "success": true,
        "message": "Logged out"
    })))
}

/// 令牌续期：换发新令牌，旧令牌立即失效
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let token = state.auth_gate.refresh_session(&auth).await?;

    Ok(Json(json!({
        "success": true,
        "token": token,
        "expiresIn": state.jwt_service.ttl_secs(),
    })))
}

/// 安全指标
pub async fn security_metrics(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let metrics = state.auth_gate.security_metrics();
    let pending_audit_events = state.audit_service.pending_fallback().await;

    Ok(Json(json!({
        "success": true,
        "metrics": metrics,
        "pendingAuditEvents": pending_audit_events,
    })))
}

/// 清除可疑 IP 标记
pub async fn clear_suspicious_ip(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiJson(request): ApiJson<ClearIpRequest>,
) -> Result<impl IntoResponse, AppError> {
    let was_flagged = state
        .auth_gate
        .clear_suspicious_ip(request.ip, &auth.identity, &auth.context)
        .await;

    Ok(Json(json!({
        "success": true,
        "ip": request.ip,
        "wasFlagged": was_flagged,
    })))
}

/// 吊销指定会话
pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiJson(request): ApiJson<RevokeSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let newly_revoked = state
        .auth_gate
        .revoke_session(request.user_id, request.issued_at, &auth.identity, &auth.context)
        .await;

    Ok(Json(json!({
        "success": true,
        "userId": request.user_id,
        "issuedAt": request.issued_at,
        "newlyRevoked": newly_revoked,
    })))
}
