//! 内存审计存储
//! 用于测试与单进程部署，语义与 PostgreSQL 实现一致

use crate::models::audit::{AuditEvent, AuditLogFilters};
use crate::repository::audit_repo::{AuditStore, AuditStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按写入顺序返回全部事件
    pub async fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.event_id == event.event_id) {
            return Err(AuditStoreError::Immutable);
        }
        events.push(event.clone());
        Ok(())
    }

    async fn update(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        let events = self.events.read().await;
        if events.iter().any(|e| e.event_id == event.event_id) {
            Err(AuditStoreError::Immutable)
        } else {
            Err(AuditStoreError::NotFound)
        }
    }

    async fn delete(&self, event_id: Uuid) -> Result<(), AuditStoreError> {
        let events = self.events.read().await;
        if events.iter().any(|e| e.event_id == event_id) {
            Err(AuditStoreError::Immutable)
        } else {
            Err(AuditStoreError::NotFound)
        }
    }

    async fn find(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError> {
        let events = self.events.read().await;
        Ok(events.iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn query(
        &self,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let events = self.events.read().await;
        let mut matched: Vec<AuditEvent> =
            events.iter().filter(|e| filters.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, filters: &AuditLogFilters) -> Result<i64, AuditStoreError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| filters.matches(e)).count() as i64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuditStoreError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.expires_at > now);
        Ok((before - events.len()) as u64)
    }
}
