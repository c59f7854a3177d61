//! PostgreSQL 连接池、迁移与追加写保护检查

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};

/// 追加写保护触发器抛出的 SQLSTATE（restrict_violation）
pub const APPEND_ONLY_VIOLATION: &str = "23001";

/// 迁移中安装的审计表触发器
const AUDIT_TRIGGERS: [&str; 2] = ["audit_events_append_only_row", "audit_events_no_truncate"];

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let started = Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect(config.url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Database connection failed");
            DbError::ConnectionFailed(e.to_string())
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connect_ms = started.elapsed().as_millis() as u64,
        "Database pool ready"
    );

    Ok(pool)
}

/// 执行迁移，并确认审计表的只追加触发器已安装
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        tracing::error!(error = %e, "Migration failed");
        DbError::MigrationFailed(e.to_string())
    })?;

    verify_append_only_guard(pool).await?;
    tracing::info!("Migrations applied, audit append-only guard in place");
    Ok(())
}

/// 审计存储在数据库层强制只追加；触发器缺失时拒绝启动
pub async fn verify_append_only_guard(pool: &PgPool) -> Result<(), DbError> {
    let installed: Vec<String> = sqlx::query_scalar(
        "SELECT tgname::text FROM pg_trigger WHERE tgrelid = 'audit_events'::regclass AND NOT tgisinternal",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbError::GuardMissing(e.to_string()))?;

    let missing: Vec<&str> = AUDIT_TRIGGERS
        .iter()
        .copied()
        .filter(|name| !installed.iter().any(|t| t == name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DbError::GuardMissing(missing.join(", ")))
    }
}

pub async fn health_check(pool: &PgPool) -> HealthStatus {
    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthStatus::Healthy,
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            HealthStatus::Unhealthy(e.to_string())
        }
    }
}

/// 判断 sqlx 错误是否来自追加写保护触发器
pub fn is_append_only_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(APPEND_ONLY_VIOLATION),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Audit append-only guard missing: {0}")]
    GuardMissing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
    /// 使用内存存储运行，没有数据库
    Detached,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy(_) => "unhealthy",
            HealthStatus::Detached => "detached",
        }
    }
}
