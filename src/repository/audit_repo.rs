//! 审计数据访问
//! 审计事件只追加；update/delete 必然失败，只有过期清理能删除记录

use crate::{db::is_append_only_violation, models::audit::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("audit events are immutable")]
    Immutable,

    #[error("audit event not found")]
    NotFound,

    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt audit row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for AuditStoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_append_only_violation(&e) {
            AuditStoreError::Immutable
        } else {
            AuditStoreError::Unavailable(e.to_string())
        }
    }
}

/// 持久化的只追加事件存储
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditStoreError>;

    /// 对已存在的事件总是失败
    async fn update(&self, event: &AuditEvent) -> Result<(), AuditStoreError>;

    /// 对已存在的事件总是失败
    async fn delete(&self, event_id: Uuid) -> Result<(), AuditStoreError>;

    async fn find(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError>;

    async fn query(
        &self,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AuditStoreError>;

    async fn count(&self, filters: &AuditLogFilters) -> Result<i64, AuditStoreError>;

    /// 删除 expires_at 已过的事件
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuditStoreError>;
}

/// audit_events 表的原始行
#[derive(Debug, sqlx::FromRow)]
struct AuditEventRow {
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
    event_type: String,
    event_category: String,
    actor_user_id: Option<Uuid>,
    actor_role: Option<String>,
    actor_name: Option<String>,
    action: String,
    resource: String,
    method: Option<String>,
    outcome: String,
    status_code: Option<i32>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
    risk_level: String,
    risk_score: i16,
    details: Json<AuditDetails>,
    retention_days: i32,
    expires_at: DateTime<Utc>,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = AuditStoreError;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        let actor = match (row.actor_user_id, row.actor_role) {
            (Some(user_id), Some(role)) => Some(Actor {
                user_id,
                role,
                name: row.actor_name,
            }),
            _ => None,
        };

        Ok(AuditEvent {
            event_id: row.event_id,
            timestamp: row.occurred_at,
            event_type: row.event_type.parse().map_err(AuditStoreError::Corrupt)?,
            event_category: row.event_category.parse().map_err(AuditStoreError::Corrupt)?,
            actor,
            action: row.action,
            resource: row.resource,
            method: row.method,
            outcome: row.outcome.parse().map_err(AuditStoreError::Corrupt)?,
            status_code: row.status_code.and_then(|c| u16::try_from(c).ok()),
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            request_id: row.request_id,
            risk_level: row.risk_level.parse().map_err(AuditStoreError::Corrupt)?,
            risk_score: row.risk_score.clamp(0, 100) as u8,
            details: row.details.0,
            retention_days: u32::try_from(row.retention_days)
                .map_err(|_| AuditStoreError::Corrupt("negative retention".to_string()))?,
            expires_at: row.expires_at,
        })
    }
}

/// 动态过滤条件的绑定参数
enum FilterArg {
    Time(DateTime<Utc>),
    Text(String),
    Id(Uuid),
}

/// 生成 WHERE 子句与对应参数
fn filter_clause(filters: &AuditLogFilters) -> (String, Vec<FilterArg>) {
    let mut clause = String::from(" WHERE 1=1");
    let mut args = Vec::new();

    let mut push = |column: &str, op: &str, arg: FilterArg| {
        args.push(arg);
        clause.push_str(&format!(" AND {} {} ${}", column, op, args.len()));
    };

    if let Some(start) = filters.start_time {
        push("occurred_at", ">=", FilterArg::Time(start));
    }
    if let Some(end) = filters.end_time {
        push("occurred_at", "<=", FilterArg::Time(end));
    }
    if let Some(event_type) = filters.event_type {
        push("event_type", "=", FilterArg::Text(event_type.as_str().to_string()));
    }
    if let Some(category) = filters.category {
        push("event_category", "=", FilterArg::Text(category.as_str().to_string()));
    }
    if let Some(user_id) = filters.user_id {
        push("actor_user_id", "=", FilterArg::Id(user_id));
    }
    if let Some(outcome) = filters.outcome {
        push("outcome", "=", FilterArg::Text(outcome.as_str().to_string()));
    }
    if let Some(risk_level) = filters.risk_level {
        push("risk_level", "=", FilterArg::Text(risk_level.as_str().to_string()));
    }
    if let Some(ip) = &filters.ip_address {
        push("ip_address", "=", FilterArg::Text(ip.clone()));
    }

    (clause, args)
}

pub struct PgAuditStore {
    db: PgPool,
}

impl PgAuditStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                event_id, occurred_at, event_type, event_category, actor_user_id, actor_role,
                actor_name, action, resource, method, outcome, status_code, ip_address,
                user_agent, request_id, risk_level, risk_score, details, retention_days, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(event.event_id)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(event.event_category.as_str())
        .bind(event.actor.as_ref().map(|a| a.user_id))
        .bind(event.actor.as_ref().map(|a| a.role.clone()))
        .bind(event.actor.as_ref().and_then(|a| a.name.clone()))
        .bind(&event.action)
        .bind(&event.resource)
        .bind(&event.method)
        .bind(event.outcome.as_str())
        .bind(event.status_code.map(i32::from))
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.request_id)
        .bind(event.risk_level.as_str())
        .bind(i16::from(event.risk_score))
        .bind(Json(&event.details))
        .bind(event.retention_days as i32)
        .bind(event.expires_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn update(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        // 触发器拒绝对已存在行的任何 UPDATE
        let result = sqlx::query(
            "UPDATE audit_events SET outcome = $2, details = $3 WHERE event_id = $1",
        )
        .bind(event.event_id)
        .bind(event.outcome.as_str())
        .bind(Json(&event.details))
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuditStoreError::NotFound);
        }

        tracing::error!(event_id = %event.event_id, "Append-only trigger missing on audit_events");
        Err(AuditStoreError::Unavailable("append-only guard missing".to_string()))
    }

    async fn delete(&self, event_id: Uuid) -> Result<(), AuditStoreError> {
        let result = sqlx::query("DELETE FROM audit_events WHERE event_id = $1 AND expires_at > now()")
            .bind(event_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() > 0 {
            tracing::error!(event_id = %event_id, "Append-only trigger missing on audit_events");
            return Err(AuditStoreError::Unavailable("append-only guard missing".to_string()));
        }

        // 已过期的事件只能由 TTL 清理移除
        match self.find(event_id).await? {
            Some(_) => Err(AuditStoreError::Immutable),
            None => Err(AuditStoreError::NotFound),
        }
    }

    async fn find(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError> {
        let row = sqlx::query_as::<_, AuditEventRow>("SELECT * FROM audit_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(AuditEvent::try_from).transpose()
    }

    async fn query(
        &self,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let (clause, args) = filter_clause(filters);
        let sql = format!(
            "SELECT * FROM audit_events{} ORDER BY occurred_at DESC LIMIT ${} OFFSET ${}",
            clause,
            args.len() + 1,
            args.len() + 2
        );

        let mut query = sqlx::query_as::<_, AuditEventRow>(&sql);
        for arg in args {
            query = match arg {
                FilterArg::Time(t) => query.bind(t),
                FilterArg::Text(s) => query.bind(s),
                FilterArg::Id(id) => query.bind(id),
            };
        }

        let rows = query.bind(limit).bind(offset).fetch_all(&self.db).await?;
        rows.into_iter().map(AuditEvent::try_from).collect()
    }

    async fn count(&self, filters: &AuditLogFilters) -> Result<i64, AuditStoreError> {
        let (clause, args) = filter_clause(filters);
        let sql = format!("SELECT COUNT(*) FROM audit_events{}", clause);

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for arg in args {
            query = match arg {
                FilterArg::Time(t) => query.bind(t),
                FilterArg::Text(s) => query.bind(s),
                FilterArg::Id(id) => query.bind(id),
            };
        }

        Ok(query.fetch_one(&self.db).await?)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, AuditStoreError> {
        // 数据库端使用自己的 now()，与触发器判断保持一致
        let removed: i64 = sqlx::query_scalar("SELECT purge_expired_audit_events()")
            .fetch_one(&self.db)
            .await?;
        Ok(removed.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_clause_numbers_placeholders_in_order() {
        let filters = AuditLogFilters {
            event_type: Some(AuditEventType::SecurityFailure),
            user_id: Some(Uuid::new_v4()),
            ip_address: Some("10.0.0.1".to_string()),
            ..Default::default()
        };

        let (clause, args) = filter_clause(&filters);
        assert_eq!(
            clause,
            " WHERE 1=1 AND event_type = $1 AND actor_user_id = $2 AND ip_address = $3"
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_empty_filters() {
        let (clause, args) = filter_clause(&AuditLogFilters::default());
        assert_eq!(clause, " WHERE 1=1");
        assert!(args.is_empty());
    }

    #[test]
    fn test_sqlx_error_maps_to_unavailable() {
        let err: AuditStoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, AuditStoreError::Unavailable(_)));
    }
}
