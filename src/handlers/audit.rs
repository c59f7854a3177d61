//! 审计日志的 HTTP 处理器（仅管理员，由路由层的 RequireRole 保证）

use crate::{
    auth::gate::AuthContext,
    error::AppError,
    extract::{ApiPath, ApiQuery},
    middleware::AppState,
    models::audit::*,
};
use axum::{
    extract::State,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub category: Option<EventCategory>,
    pub user_id: Option<Uuid>,
    pub outcome: Option<Outcome>,
    pub risk_level: Option<AuditRiskLevel>,
    pub ip_address: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

fn default_hours() -> i64 {
    24
}

/// 统计窗口上限 30 天
fn validate_hours(hours: i64) -> Result<(), AppError> {
    if (1..=24 * 30).contains(&hours) {
        Ok(())
    } else {
        Err(AppError::validation("hours must be between 1 and 720"))
    }
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// 查询审计日志
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiQuery(query): ApiQuery<AuditLogQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = AuditLogFilters {
        start_time: query.start_time,
        end_time: query.end_time,
        event_type: query.event_type,
        category: query.category,
        user_id: query.user_id,
        outcome: query.outcome,
        risk_level: query.risk_level,
        ip_address: query.ip_address,
    };

    let page = state
        .audit_service
        .query_logs(&filters, query.page, query.limit)
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": page
    })))
}

/// 仪表盘统计
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiQuery(query): ApiQuery<WindowQuery>,
) -> Result<impl IntoResponse, AppError> {
    validate_hours(query.hours)?;
    let stats = state.audit_service.dashboard_stats(query.hours).await?;

    Ok(Json(json!({
        "success": true,
        "data": stats
    })))
}

/// 最近的安全事件
pub async fn recent_security_events(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Result<impl IntoResponse, AppError> {
    let events = state
        .audit_service
        .recent_security_events(query.limit)
        .await?;

    Ok(Json(json!({
        "success": true,
        "count": events.len(),
        "events": events
    })))
}

/// 按 IP 聚合的认证失败
pub async fn failed_logins(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiQuery(query): ApiQuery<WindowQuery>,
) -> Result<impl IntoResponse, AppError> {
    validate_hours(query.hours)?;
    let groups = state.audit_service.failed_logins_by_ip(query.hours).await?;

    Ok(Json(json!({
        "success": true,
        "count": groups.len(),
        "data": groups
    })))
}

/// 高风险可疑活动
pub async fn suspicious_activities(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Result<impl IntoResponse, AppError> {
    let events = state.audit_service.suspicious_activities(query.limit).await?;

    Ok(Json(json!({
        "success": true,
        "count": events.len(),
        "events": events
    })))
}

/// 用户活动时间线
pub async fn user_timeline(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Result<impl IntoResponse, AppError> {
    let events = state.audit_service.user_timeline(user_id, query.limit).await?;

    Ok(Json(json!({
        "success": true,
        "userId": user_id,
        "count": events.len(),
        "events": events
    })))
}
