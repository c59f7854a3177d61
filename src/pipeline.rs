//! 安全管道
//! 有序的类型化阶段列表，由单个调度循环执行；
//! 每个阶段返回 `Flow::Continue` 或 `Flow::Terminate(denial)`

use crate::{
    auth::{
        anomaly::{AnomalyTracker, ANOMALY_ALERT_SCORE},
        gate::{AuthContext, AuthGate},
    },
    error::{Denial, DenialCode},
    models::{
        audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome, RiskContext},
        context::RequestMeta,
    },
    services::{
        audit_service::AuditService,
        policy_service::{Policy, PolicyEngine, RouteMetadata},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// 一次请求在管道中的可变状态
#[derive(Debug)]
pub struct Exchange {
    pub meta: RequestMeta,
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    /// 已解码的查询参数
    pub query_params: Vec<(String, String)>,
    /// JSON 请求体（仅 application/json）
    pub body: Option<Value>,
    pub auth: Option<AuthContext>,
}

impl Exchange {
    pub fn new(meta: RequestMeta, request_id: impl Into<String>) -> Self {
        Self {
            meta,
            request_id: request_id.into(),
            received_at: Utc::now(),
            query_params: Vec::new(),
            body: None,
            auth: None,
        }
    }

    fn denial(&self, code: DenialCode) -> Denial {
        Denial::new(code, self.request_id.clone(), self.received_at)
    }
}

#[derive(Debug)]
pub enum Flow {
    Continue,
    Terminate(Denial),
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, exchange: &mut Exchange) -> Flow;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 依次执行，遇到第一个终止即返回
    pub async fn dispatch(&self, exchange: &mut Exchange) -> Result<(), Denial> {
        for stage in &self.stages {
            match stage.run(exchange).await {
                Flow::Continue => {}
                Flow::Terminate(denial) => {
                    tracing::debug!(
                        stage = stage.name(),
                        request_id = %exchange.request_id,
                        code = denial.code.as_str(),
                        "Pipeline terminated"
                    );
                    return Err(denial);
                }
            }
        }
        Ok(())
    }
}

/// 认证阶段
pub struct AuthStage {
    gate: Arc<AuthGate>,
}

impl AuthStage {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl PipelineStage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, exchange: &mut Exchange) -> Flow {
        match self
            .gate
            .authenticate(&exchange.meta, &exchange.request_id)
            .await
        {
            Ok(auth) => {
                exchange.auth = Some(auth);
                Flow::Continue
            }
            Err(denial) => Flow::Terminate(denial),
        }
    }
}

struct InputPattern {
    regex: Regex,
    event_type: AuditEventType,
    label: &'static str,
}

static INPUT_PATTERNS: Lazy<Vec<InputPattern>> = Lazy::new(|| {
    vec![
        InputPattern {
            regex: Regex::new(r"(?i)<script").expect("valid pattern"),
            event_type: AuditEventType::XssAttempt,
            label: "script_tag",
        },
        InputPattern {
            regex: Regex::new(r"(?i)javascript:").expect("valid pattern"),
            event_type: AuditEventType::XssAttempt,
            label: "javascript_uri",
        },
        InputPattern {
            regex: Regex::new(r"(?i)onerror\s*=").expect("valid pattern"),
            event_type: AuditEventType::XssAttempt,
            label: "event_handler",
        },
        InputPattern {
            regex: Regex::new(r"\.\./").expect("valid pattern"),
            event_type: AuditEventType::InjectionAttempt,
            label: "path_traversal",
        },
        InputPattern {
            regex: Regex::new(r"(?i)union.*select").expect("valid pattern"),
            event_type: AuditEventType::InjectionAttempt,
            label: "sql_union",
        },
    ]
});

/// 请求完整性阶段：扫描查询参数与 JSON 请求体中的注入特征
pub struct IntegrityStage {
    audit: Arc<AuditService>,
}

impl IntegrityStage {
    pub fn new(audit: Arc<AuditService>) -> Self {
        Self { audit }
    }
}

fn scan_input(exchange: &Exchange) -> Option<&'static InputPattern> {
    let mut haystack = String::new();
    for (key, value) in &exchange.query_params {
        haystack.push_str(key);
        haystack.push('=');
        haystack.push_str(value);
        haystack.push('\n');
    }
    if let Some(body) = &exchange.body {
        haystack.push_str(&body.to_string());
    }

    INPUT_PATTERNS.iter().find(|p| p.regex.is_match(&haystack))
}

#[async_trait]
impl PipelineStage for IntegrityStage {
    fn name(&self) -> &'static str {
        "integrity"
    }

    async fn run(&self, exchange: &mut Exchange) -> Flow {
        let Some(pattern) = scan_input(exchange) else {
            return Flow::Continue;
        };

        tracing::warn!(
            request_id = %exchange.request_id,
            client_ip = %exchange.meta.client_ip,
            pattern = pattern.label,
            "Suspicious request content"
        );

        let actor = exchange.auth.as_ref().map(|a| Actor::from(&a.identity));
        let event = NewAuditEvent::new(
            pattern.event_type,
            Outcome::Blocked,
            format!("{} {}", exchange.meta.method, exchange.meta.path),
            exchange.meta.path.clone(),
            AuditDetails::security(pattern.label, None),
        )
        .actor(actor)
        .method(exchange.meta.method.as_str())
        .status(400)
        .origin(exchange.meta.origin(&exchange.request_id));

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, "Failed to audit injection attempt");
        }

        Flow::Terminate(exchange.denial(DenialCode::MaliciousInput))
    }
}

/// 上下文策略阶段，同时做请求模式异常评分（只记录不拦截）
pub struct PolicyStage {
    engine: Arc<PolicyEngine>,
    anomaly: Arc<AnomalyTracker>,
    audit: Arc<AuditService>,
    policies: Vec<Policy>,
}

impl PolicyStage {
    pub fn new(
        engine: Arc<PolicyEngine>,
        anomaly: Arc<AnomalyTracker>,
        audit: Arc<AuditService>,
        policies: Vec<Policy>,
    ) -> Self {
        Self {
            engine,
            anomaly,
            audit,
            policies,
        }
    }
}

#[async_trait]
impl PipelineStage for PolicyStage {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn run(&self, exchange: &mut Exchange) -> Flow {
        let Some(auth) = exchange.auth.as_ref() else {
            tracing::error!(request_id = %exchange.request_id, "Policy stage reached without identity");
            return Flow::Terminate(exchange.denial(DenialCode::InternalError));
        };

        let score = self.anomaly.observe(auth.identity.user_id, &exchange.meta.path);
        if score >= ANOMALY_ALERT_SCORE {
            tracing::warn!(
                request_id = %exchange.request_id,
                user_id = %auth.identity.user_id,
                anomaly_score = score,
                "Anomalous request pattern"
            );
            let event = NewAuditEvent::new(
                AuditEventType::AnomalyDetected,
                Outcome::Warning,
                "Analyze request pattern",
                exchange.meta.path.clone(),
                AuditDetails::Security {
                    indicator: "request_pattern".to_string(),
                    detail: None,
                    anomaly_score: Some(score),
                },
            )
            .actor(Actor::from(&auth.identity))
            .method(exchange.meta.method.as_str())
            .origin(auth.context.origin())
            .risk(RiskContext {
                anomaly_score: Some(score),
                ..RiskContext::default()
            });

            if let Err(e) = self.audit.log(event).await {
                tracing::error!(error = %e, "Failed to audit anomaly");
            }
        }

        let route = RouteMetadata {
            method: exchange.meta.method.clone(),
            path: exchange.meta.path.clone(),
            policies: self.policies.clone(),
        };

        match self
            .engine
            .enforce(&auth.identity, &route, exchange.body.as_ref(), &auth.context)
            .await
        {
            Ok(()) => Flow::Continue,
            Err(denial) => Flow::Terminate(denial),
        }
    }
}
