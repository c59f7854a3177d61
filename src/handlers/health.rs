//! 存活与就绪探针

use axum::{extract::State, http::StatusCode, Json};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::{db, middleware::AppState};

static STARTED_AT: OnceCell<Instant> = OnceCell::new();

/// main 启动时调用一次
pub fn set_start_time() {
    let _ = STARTED_AT.set(Instant::now());
}

pub fn get_uptime() -> u64 {
    STARTED_AT.get().map_or(0, |t| t.elapsed().as_secs())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

#[derive(Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn new(name: &'static str, status: &'static str, message: Option<String>) -> Self {
        Self {
            name,
            status,
            message,
        }
    }
}

/// 不检查任何依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: get_uptime(),
    })
}

/// 数据库不可用时返回 503；审计回退队列积压只标记为 degraded
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let database = match &state.db {
        Some(pool) => db::health_check(pool).await,
        None => db::HealthStatus::Detached,
    };
    let database_message = match &database {
        db::HealthStatus::Unhealthy(msg) => Some(msg.clone()),
        _ => None,
    };

    let pending = state.audit_service.pending_fallback().await;
    let checks = vec![
        HealthCheck::new("database", database.as_str(), database_message),
        if pending == 0 {
            HealthCheck::new("audit_fallback", "healthy", None)
        } else {
            HealthCheck::new(
                "audit_fallback",
                "degraded",
                Some(format!("{} events awaiting replay", pending)),
            )
        },
    ];

    let ready = checks.iter().all(|c| c.status != "unhealthy");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, checks }))
}
