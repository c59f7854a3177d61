//! 策略引擎
//! 按路由声明的顺序评估策略，返回第一个拒绝；评估本身无副作用

use crate::{
    config::AppConfig,
    error::{Denial, DenialCode},
    models::{
        audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome},
        context::SecurityContext,
        identity::{Identity, RiskLevel, Role},
    },
    services::audit_service::AuditService,
};
use axum::http::Method;
use serde_json::Value;
use std::sync::Arc;

/// 上下文策略
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    /// 未认证的农户不能执行
    VerifiedFarmerOnly,
    /// 大额订单要求买家信任分不低于阈值
    TrustedBuyerOnly { threshold: u8 },
    /// 高风险账户一律拒绝，管理员除外
    AntiFraudGuard,
    /// 管理员只能对白名单路径执行写操作
    AdminReadOnly,
    /// 角色要求
    RequireRole(Vec<Role>),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::VerifiedFarmerOnly => "VerifiedFarmerOnly",
            Policy::TrustedBuyerOnly { .. } => "TrustedBuyerOnly",
            Policy::AntiFraudGuard => "AntiFraudGuard",
            Policy::AdminReadOnly => "AdminReadOnly",
            Policy::RequireRole(_) => "RequireRole",
        }
    }

    /// 拒绝时记录的审计事件类型与拒绝码
    fn denial_kind(&self) -> (AuditEventType, DenialCode) {
        match self {
            Policy::VerifiedFarmerOnly | Policy::AdminReadOnly | Policy::RequireRole(_) => {
                (AuditEventType::AccessDenied, DenialCode::InsufficientPermissions)
            }
            Policy::TrustedBuyerOnly { .. } | Policy::AntiFraudGuard => {
                (AuditEventType::PolicyViolation, DenialCode::PolicyViolation)
            }
        }
    }
}

/// 路由元数据
#[derive(Debug, Clone)]
pub struct RouteMetadata {
    pub method: Method,
    pub path: String,
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny { policy: Policy, reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

pub struct PolicyEngine {
    audit: Arc<AuditService>,
    bulk_order_cutoff: f64,
    admin_write_allowlist: Vec<String>,
}

impl PolicyEngine {
    pub fn new(audit: Arc<AuditService>, config: &AppConfig) -> Self {
        Self {
            audit,
            bulk_order_cutoff: config.security.bulk_order_cutoff,
            admin_write_allowlist: config.security.admin_write_allowlist.clone(),
        }
    }

    /// 纯评估
    pub fn evaluate(
        &self,
        identity: &Identity,
        route: &RouteMetadata,
        body: Option<&Value>,
    ) -> PolicyDecision {
        for policy in &route.policies {
            if let Some(reason) = self.check(policy, identity, route, body) {
                return PolicyDecision::Deny {
                    policy: policy.clone(),
                    reason,
                };
            }
        }
        PolicyDecision::Allow
    }

    fn check(
        &self,
        policy: &Policy,
        identity: &Identity,
        route: &RouteMetadata,
        body: Option<&Value>,
    ) -> Option<String> {
        match policy {
            Policy::VerifiedFarmerOnly => (identity.role == Role::Farmer && !identity.verified)
                .then(|| {
                    "Only verified farmers can perform this action. Please complete your profile verification."
                        .to_string()
                }),
            Policy::TrustedBuyerOnly { threshold } => {
                let total = order_value(body);
                (identity.role == Role::Buyer
                    && total > self.bulk_order_cutoff
                    && identity.trust_score < *threshold)
                    .then(|| {
                        format!(
                            "Bulk orders (> {} INR) require a Trust Score of {}+. Your current score: {}.",
                            self.bulk_order_cutoff, threshold, identity.trust_score
                        )
                    })
            }
            Policy::AntiFraudGuard => {
                (identity.risk_level == RiskLevel::High && !identity.is_admin()).then(|| {
                    "Suspicious activity detected. Access is restricted pending administrative review."
                        .to_string()
                })
            }
            Policy::AdminReadOnly => {
                let mutating = matches!(
                    route.method,
                    Method::POST | Method::PUT | Method::PATCH | Method::DELETE
                );
                let allowlisted = self
                    .admin_write_allowlist
                    .iter()
                    .any(|prefix| within_prefix(&route.path, prefix));
                (identity.is_admin() && mutating && !allowlisted).then(|| {
                    "Admins have read-only access to marketplace data.".to_string()
                })
            }
            Policy::RequireRole(roles) => (!roles.contains(&identity.role)).then(|| {
                let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
                format!("Access denied. Required role: {}", names.join(" or "))
            }),
        }
    }

    /// 评估并在拒绝时同步写入审计
    pub async fn enforce(
        &self,
        identity: &Identity,
        route: &RouteMetadata,
        body: Option<&Value>,
        context: &SecurityContext,
    ) -> Result<(), Denial> {
        let (policy, reason) = match self.evaluate(identity, route, body) {
            PolicyDecision::Allow => return Ok(()),
            PolicyDecision::Deny { policy, reason } => (policy, reason),
        };

        let (event_type, code) = policy.denial_kind();
        metrics::counter!("policy_denials_total", "policy" => policy.name()).increment(1);
        tracing::warn!(
            request_id = %context.request_id,
            user_id = %identity.user_id,
            policy = policy.name(),
            code = code.as_str(),
            "Policy denied request"
        );

        let event = NewAuditEvent::new(
            event_type,
            Outcome::Blocked,
            format!("Access {}", route.path),
            route.path.clone(),
            AuditDetails::Authorization {
                policy: policy.name().to_string(),
                reason: reason.clone(),
                route: format!("{} {}", route.method, route.path),
            },
        )
        .actor(Actor::from(identity))
        .method(route.method.as_str())
        .status(code.status_code().as_u16())
        .origin(context.origin());

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, request_id = %context.request_id, "Failed to audit policy denial");
        }

        Err(Denial::new(code, context.request_id.clone(), context.timestamp).with_message(reason))
    }
}

/// price * quantity；数字或数字字符串，缺失按 0 计
pub fn order_value(body: Option<&Value>) -> f64 {
    let field = |name: &str| -> f64 {
        match body.and_then(|b| b.get(name)) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        }
    };

    let total = field("price") * field("quantity");
    if total.is_finite() {
        total
    } else {
        0.0
    }
}

/// 路径等于前缀，或以 `前缀/` 开头；`/admin/securityX` 不算在 `/admin/security` 之下
fn within_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::identity::AccountStatus;
    use crate::repository::InMemoryAuditStore;
    use serde_json::json;
    use serial_test::serial;
    use uuid::Uuid;

    fn engine() -> PolicyEngine {
        std::env::set_var("GUARD_DATABASE__URL", "postgresql://localhost/test");
        let config = AppConfig::from_env().unwrap();
        std::env::remove_var("GUARD_DATABASE__URL");
        let audit = Arc::new(AuditService::new(Arc::new(InMemoryAuditStore::new()), &config));
        PolicyEngine::new(audit, &config)
    }

    fn identity(role: Role, verified: bool, risk: RiskLevel, trust: u8) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            name: "Test".to_string(),
            role,
            verified,
            risk_level: risk,
            trust_score: trust,
            account_status: AccountStatus::Active,
        }
    }

    fn route(method: Method, path: &str, policies: Vec<Policy>) -> RouteMetadata {
        RouteMetadata {
            method,
            path: path.to_string(),
            policies,
        }
    }

    #[test]
    #[serial]
    fn test_verified_farmer_only() {
        let engine = engine();
        let r = route(Method::POST, "/api/v1/uploads/products", vec![Policy::VerifiedFarmerOnly]);

        let unverified = identity(Role::Farmer, false, RiskLevel::Low, 50);
        assert!(!engine.evaluate(&unverified, &r, None).is_allowed());

        let verified = identity(Role::Farmer, true, RiskLevel::Low, 50);
        assert!(engine.evaluate(&verified, &r, None).is_allowed());

        // 买家不受该策略影响
        let buyer = identity(Role::Buyer, false, RiskLevel::Low, 50);
        assert!(engine.evaluate(&buyer, &r, None).is_allowed());
    }

    #[test]
    #[serial]
    fn test_trusted_buyer_bulk_order() {
        let engine = engine();
        let r = route(
            Method::POST,
            "/api/v1/orders/authorize",
            vec![Policy::TrustedBuyerOnly { threshold: 70 }],
        );
        let buyer = identity(Role::Buyer, true, RiskLevel::Low, 40);

        match engine.evaluate(&buyer, &r, Some(&json!({"price": 1000, "quantity": 60}))) {
            PolicyDecision::Deny { policy, reason } => {
                assert_eq!(policy.name(), "TrustedBuyerOnly");
                assert!(reason.contains("70"));
                assert!(reason.contains("40"));
            }
            PolicyDecision::Allow => panic!("bulk order should be denied"),
        }

        // 恰好等于阈值不算大额
        assert!(engine
            .evaluate(&buyer, &r, Some(&json!({"price": "1000", "quantity": "50"})))
            .is_allowed());
        assert!(engine.evaluate(&buyer, &r, None).is_allowed());

        let trusted = identity(Role::Buyer, true, RiskLevel::Low, 70);
        assert!(engine
            .evaluate(&trusted, &r, Some(&json!({"price": 1000, "quantity": 60})))
            .is_allowed());
    }

    #[test]
    #[serial]
    fn test_anti_fraud_admin_bypass() {
        let engine = engine();
        let r = route(Method::GET, "/api/v1/users/x/profile", vec![Policy::AntiFraudGuard]);

        assert!(!engine
            .evaluate(&identity(Role::Buyer, true, RiskLevel::High, 90), &r, None)
            .is_allowed());
        assert!(engine
            .evaluate(&identity(Role::Buyer, true, RiskLevel::Medium, 90), &r, None)
            .is_allowed());
        assert!(engine
            .evaluate(&identity(Role::Admin, true, RiskLevel::High, 90), &r, None)
            .is_allowed());
    }

    #[test]
    #[serial]
    fn test_admin_read_only_with_allowlist() {
        let engine = engine();
        let admin = identity(Role::Admin, true, RiskLevel::Low, 100);

        let write = route(Method::POST, "/api/v1/uploads/profile", vec![Policy::AdminReadOnly]);
        assert!(!engine.evaluate(&admin, &write, None).is_allowed());

        let read = route(Method::GET, "/api/v1/uploads/profile", vec![Policy::AdminReadOnly]);
        assert!(engine.evaluate(&admin, &read, None).is_allowed());

        let system = route(
            Method::POST,
            "/api/v1/admin/security/clear-ip",
            vec![Policy::AdminReadOnly],
        );
        assert!(engine.evaluate(&admin, &system, None).is_allowed());

        let exact = route(Method::POST, "/api/v1/admin/security", vec![Policy::AdminReadOnly]);
        assert!(engine.evaluate(&admin, &exact, None).is_allowed());

        // 只共享字符前缀的路径不在放行范围内
        let lookalike = route(
            Method::POST,
            "/api/v1/admin/securityX",
            vec![Policy::AdminReadOnly],
        );
        assert!(!engine.evaluate(&admin, &lookalike, None).is_allowed());
        let sibling = route(
            Method::POST,
            "/api/v1/ml/alerts/trigger-all",
            vec![Policy::AdminReadOnly],
        );
        assert!(!engine.evaluate(&admin, &sibling, None).is_allowed());
    }

    #[test]
    #[serial]
    fn test_first_denial_wins() {
        let engine = engine();
        let r = route(
            Method::POST,
            "/api/v1/uploads/products",
            vec![
                Policy::RequireRole(vec![Role::Farmer]),
                Policy::AntiFraudGuard,
            ],
        );
        let risky_buyer = identity(Role::Buyer, true, RiskLevel::High, 10);

        match engine.evaluate(&risky_buyer, &r, None) {
            PolicyDecision::Deny { policy, .. } => assert_eq!(policy.name(), "RequireRole"),
            PolicyDecision::Allow => panic!("should deny"),
        }
    }

    #[test]
    fn test_order_value_parsing() {
        assert_eq!(order_value(Some(&json!({"price": 2.5, "quantity": 4}))), 10.0);
        assert_eq!(order_value(Some(&json!({"price": "abc", "quantity": 4}))), 0.0);
        assert_eq!(order_value(Some(&json!({"price": 100}))), 0.0);
        assert_eq!(order_value(None), 0.0);
    }
}
