//! 审计日志服务
//! 风险评分、追加写入、写入失败回退，以及只读查询视图

use crate::{
    config::AppConfig,
    error::AppError,
    models::audit::*,
    repository::audit_repo::{AuditStore, AuditStoreError},
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 聚合视图一次最多读取的事件数
const AGGREGATION_SCAN_LIMIT: i64 = 10_000;

/// 根据事件类型、结果与上下文计算风险分数（0-100）
pub fn assess_risk(
    event_type: AuditEventType,
    outcome: Outcome,
    context: &RiskContext,
) -> (u8, AuditRiskLevel) {
    let mut score: u32 = match event_type.severity() {
        Some(Severity::High) => 80,
        Some(Severity::Medium) => 50,
        None if matches!(outcome, Outcome::Failure | Outcome::Blocked) => 30,
        None => 10,
    };

    if context.repeated_failure {
        score += 20;
    }
    if context.suspicious_ip {
        score += 15;
    }
    if context.anomaly_score.is_some_and(|s| s > 0.7) {
        score += 25;
    }

    let score = score.min(100) as u8;
    (score, AuditRiskLevel::from_score(score))
}

pub struct AuditService {
    store: Arc<dyn AuditStore>,
    retention_days: u32,
    write_timeout: Duration,
    write_retries: u32,
    defer_low_risk: bool,
    production: bool,
    /// 持久化失败的事件，等待后台重放
    fallback: Mutex<VecDeque<AuditEvent>>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>, config: &AppConfig) -> Self {
        Self {
            store,
            retention_days: config.audit.retention_days,
            write_timeout: Duration::from_millis(config.audit.write_timeout_ms),
            write_retries: config.audit.write_retries,
            defer_low_risk: config.audit.defer_low_risk,
            production: config.server.is_production(),
            fallback: Mutex::new(VecDeque::new()),
        }
    }

    /// 分配 ID、风险与过期时间
    pub fn build_event(&self, new: NewAuditEvent) -> AuditEvent {
        let (risk_score, risk_level) = assess_risk(new.event_type, new.outcome, &new.risk);
        let timestamp = Utc::now();

        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp,
            event_type: new.event_type,
            event_category: new.event_type.category(),
            actor: new.actor,
            action: new.action,
            resource: new.resource,
            method: new.method,
            outcome: new.outcome,
            status_code: new.status_code,
            ip_address: new.origin.ip_address,
            user_agent: new.origin.user_agent,
            request_id: new.origin.request_id,
            risk_level,
            risk_score,
            details: new.details,
            retention_days: self.retention_days,
            expires_at: AuditEvent::expiry_for(timestamp, self.retention_days),
        }
    }

    /// 同步写入：返回前事件已持久化，或已进入回退通道
    pub async fn log(&self, new: NewAuditEvent) -> Result<AuditEvent, AppError> {
        let event = self.build_event(new);

        metrics::counter!("audit_events_total", "category" => event.event_category.as_str())
            .increment(1);

        match event.risk_level {
            AuditRiskLevel::High | AuditRiskLevel::Critical => tracing::warn!(
                event_type = event.event_type.as_str(),
                outcome = event.outcome.as_str(),
                risk_score = event.risk_score,
                request_id = ?event.request_id,
                "Audit event"
            ),
            _ => tracing::debug!(
                event_type = event.event_type.as_str(),
                outcome = event.outcome.as_str(),
                risk_score = event.risk_score,
                "Audit event"
            ),
        }

        if let Err(e) = self.persist(&event).await {
            self.escalate(&event, &e).await;
            if !self.production {
                return Err(AppError::AuditWrite(e.to_string()));
            }
        }

        Ok(event)
    }

    /// 低风险成功事件可异步写入；写入失败同样进入回退通道
    pub async fn log_success(self: &Arc<Self>, new: NewAuditEvent) -> Result<(), AppError> {
        let (_, level) = assess_risk(new.event_type, new.outcome, &new.risk);
        let deferrable =
            self.defer_low_risk && new.outcome == Outcome::Success && level == AuditRiskLevel::Low;

        if !deferrable {
            return self.log(new).await.map(|_| ());
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.log(new).await {
                tracing::warn!(error = %e, "Deferred audit write failed");
            }
        });
        Ok(())
    }

    /// 带超时与重试的写入
    async fn persist(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        let mut last_error = AuditStoreError::Unavailable("no attempt made".to_string());

        for attempt in 0..=self.write_retries {
            match tokio::time::timeout(self.write_timeout, self.store.append(event)).await {
                Ok(Ok(())) => return Ok(()),
                // 超时的那次写入其实已落库，重试时命中主键
                Ok(Err(AuditStoreError::Immutable)) if attempt > 0 => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = AuditStoreError::Unavailable(format!(
                        "write timed out after {}ms",
                        self.write_timeout.as_millis()
                    ))
                }
            }
            tracing::debug!(attempt, event_id = %event.event_id, "Audit write attempt failed");
        }

        Err(last_error)
    }

    /// 回退通道：错误日志 + 待重放队列，事件从不丢弃
    async fn escalate(&self, event: &AuditEvent, error: &AuditStoreError) {
        let serialized = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        tracing::error!(
            target: "audit_fallback",
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            error = %error,
            event = %serialized,
            "Audit store write failed, event queued for replay"
        );
        metrics::counter!("audit_fallback_total").increment(1);
        self.fallback.lock().await.push_back(event.clone());
    }

    /// 重放回退队列，返回成功写入的数量
    pub async fn replay_fallback(&self) -> usize {
        let pending: Vec<AuditEvent> = self.fallback.lock().await.drain(..).collect();
        if pending.is_empty() {
            return 0;
        }

        let mut written = 0;
        let mut failed = Vec::new();
        for event in pending {
            match self.persist(&event).await {
                Ok(()) => written += 1,
                Err(_) => failed.push(event),
            }
        }

        if !failed.is_empty() {
            tracing::warn!(remaining = failed.len(), "Audit fallback replay incomplete");
            let mut queue = self.fallback.lock().await;
            for event in failed.into_iter().rev() {
                queue.push_front(event);
            }
        }

        written
    }

    pub async fn pending_fallback(&self) -> usize {
        self.fallback.lock().await.len()
    }

    /// 审计事件不可修改；该调用必然失败
    pub async fn update_event(&self, event: &AuditEvent) -> Result<(), AppError> {
        self.store.update(event).await.map_err(AppError::from)
    }

    /// 审计事件不可删除；该调用必然失败
    pub async fn delete_event(&self, event_id: Uuid) -> Result<(), AppError> {
        self.store.delete(event_id).await.map_err(AppError::from)
    }

    pub async fn find_event(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AppError> {
        Ok(self.store.find(event_id).await?)
    }

    /// 分页查询
    pub async fn query_logs(
        &self,
        filters: &AuditLogFilters,
        page: u32,
        limit: u32,
    ) -> Result<AuditPage, AppError> {
        let limit = limit.clamp(1, 100);
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let logs = self.store.query(filters, i64::from(limit), offset).await?;
        let total = self.store.count(filters).await?;
        let total_pages = ((total.max(0) as u64).div_ceil(u64::from(limit))) as u32;

        Ok(AuditPage {
            logs,
            total,
            page,
            total_pages,
        })
    }

    /// 最近 24 小时的安全类事件
    pub async fn recent_security_events(&self, limit: u32) -> Result<Vec<AuditEvent>, AppError> {
        let filters = AuditLogFilters {
            category: Some(EventCategory::Security),
            start_time: Some(Utc::now() - ChronoDuration::hours(24)),
            ..Default::default()
        };
        Ok(self.store.query(&filters, i64::from(limit.clamp(1, 500)), 0).await?)
    }

    /// 最近 7 天的高风险或可疑事件
    pub async fn suspicious_activities(&self, limit: u32) -> Result<Vec<AuditEvent>, AppError> {
        let filters = AuditLogFilters {
            start_time: Some(Utc::now() - ChronoDuration::days(7)),
            ..Default::default()
        };
        let events = self.store.query(&filters, AGGREGATION_SCAN_LIMIT, 0).await?;

        Ok(events
            .into_iter()
            .filter(|e| {
                matches!(e.risk_level, AuditRiskLevel::High | AuditRiskLevel::Critical)
                    || matches!(
                        e.event_type,
                        AuditEventType::FraudDetected
                            | AuditEventType::AnomalyDetected
                            | AuditEventType::SuspiciousActivity
                    )
            })
            .take(limit.clamp(1, 500) as usize)
            .collect())
    }

    /// 按 IP 聚合的认证失败
    pub async fn failed_logins_by_ip(&self, hours: i64) -> Result<Vec<FailedLoginsByIp>, AppError> {
        let since = Utc::now() - ChronoDuration::hours(hours.clamp(1, 24 * 30));
        let mut grouped: HashMap<String, FailedLoginsByIp> = HashMap::new();

        for event_type in [AuditEventType::SecurityFailure, AuditEventType::LoginFailed] {
            let filters = AuditLogFilters {
                event_type: Some(event_type),
                start_time: Some(since),
                ..Default::default()
            };

            for event in self.store.query(&filters, AGGREGATION_SCAN_LIMIT, 0).await? {
                let ip = event.ip_address.clone().unwrap_or_else(|| "unknown".to_string());
                let code = match &event.details {
                    AuditDetails::Authentication { code: Some(code), .. } => Some(code.clone()),
                    _ => None,
                };

                let entry = grouped.entry(ip.clone()).or_insert_with(|| FailedLoginsByIp {
                    ip_address: ip,
                    attempts: 0,
                    last_attempt: event.timestamp,
                    codes: Vec::new(),
                });
                entry.attempts += 1;
                entry.last_attempt = entry.last_attempt.max(event.timestamp);
                if let Some(code) = code {
                    if !entry.codes.contains(&code) {
                        entry.codes.push(code);
                    }
                }
            }
        }

        let mut result: Vec<_> = grouped.into_values().collect();
        result.sort_by(|a, b| b.attempts.cmp(&a.attempts).then(b.last_attempt.cmp(&a.last_attempt)));
        Ok(result)
    }

    pub async fn user_timeline(&self, user_id: Uuid, limit: u32) -> Result<Vec<AuditEvent>, AppError> {
        let filters = AuditLogFilters {
            user_id: Some(user_id),
            ..Default::default()
        };
        Ok(self.store.query(&filters, i64::from(limit.clamp(1, 500)), 0).await?)
    }

    /// 仪表盘统计
    pub async fn dashboard_stats(&self, hours: i64) -> Result<DashboardStats, AppError> {
        let hours = hours.clamp(1, 24 * 30);
        let filters = AuditLogFilters {
            start_time: Some(Utc::now() - ChronoDuration::hours(hours)),
            ..Default::default()
        };

        let total = self.store.count(&filters).await?;
        let events = self.store.query(&filters, AGGREGATION_SCAN_LIMIT, 0).await?;

        let mut by_category = BTreeMap::new();
        let mut by_outcome = BTreeMap::new();
        let mut by_risk_level = BTreeMap::new();
        for event in &events {
            *by_category.entry(event.event_category).or_insert(0u64) += 1;
            *by_outcome.entry(event.outcome).or_insert(0u64) += 1;
            *by_risk_level.entry(event.risk_level).or_insert(0u64) += 1;
        }

        Ok(DashboardStats {
            window_hours: hours,
            total_events: total.max(0) as u64,
            critical_events: by_risk_level.get(&AuditRiskLevel::Critical).copied().unwrap_or(0),
            blocked_requests: by_outcome.get(&Outcome::Blocked).copied().unwrap_or(0),
            by_category,
            by_outcome,
            by_risk_level,
        })
    }

    /// TTL 清理
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged expired audit events");
        }
        Ok(removed)
    }
}
