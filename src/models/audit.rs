//! Audit domain models

use crate::models::{context::RequestOrigin, identity::Identity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    // Authentication
    LoginSuccess,
    LoginFailed,
    Logout,
    TokenRefresh,
    TokenRevoked,
    AuthSuccess,
    SecurityFailure,
    SessionRevoked,
    FingerprintMismatch,
    IpFlagged,
    IpCleared,
    // Authorization
    AccessGranted,
    AccessDenied,
    RoleViolation,
    PolicyViolation,
    PermissionDenied,
    // Data access
    DataRead,
    DataWrite,
    DataUpdate,
    DataDelete,
    DataExport,
    SensitiveDataAccess,
    // Security
    FraudDetected,
    AnomalyDetected,
    SuspiciousActivity,
    RateLimitExceeded,
    MaliciousFileUpload,
    InjectionAttempt,
    XssAttempt,
    // Privacy
    ConsentGranted,
    ConsentWithdrawn,
    DataDeletionRequested,
    DataDeletionCompleted,
    AccountAnonymized,
    // File upload
    FileUploadSuccess,
    FileUploadFailed,
    FileValidationFailed,
    FileDeleted,
    // System
    SystemError,
    ConfigurationChanged,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 40] = [
        AuditEventType::LoginSuccess,
        AuditEventType::LoginFailed,
        AuditEventType::Logout,
        AuditEventType::TokenRefresh,
        AuditEventType::TokenRevoked,
        AuditEventType::AuthSuccess,
        AuditEventType::SecurityFailure,
        AuditEventType::SessionRevoked,
        AuditEventType::FingerprintMismatch,
        AuditEventType::IpFlagged,
        AuditEventType::IpCleared,
        AuditEventType::AccessGranted,
        AuditEventType::AccessDenied,
        AuditEventType::RoleViolation,
        AuditEventType::PolicyViolation,
        AuditEventType::PermissionDenied,
        AuditEventType::DataRead,
        AuditEventType::DataWrite,
        AuditEventType::DataUpdate,
        AuditEventType::DataDelete,
        AuditEventType::DataExport,
        AuditEventType::SensitiveDataAccess,
        AuditEventType::FraudDetected,
        AuditEventType::AnomalyDetected,
        AuditEventType::SuspiciousActivity,
        AuditEventType::RateLimitExceeded,
        AuditEventType::MaliciousFileUpload,
        AuditEventType::InjectionAttempt,
        AuditEventType::XssAttempt,
        AuditEventType::ConsentGranted,
        AuditEventType::ConsentWithdrawn,
        AuditEventType::DataDeletionRequested,
        AuditEventType::DataDeletionCompleted,
        AuditEventType::AccountAnonymized,
        AuditEventType::FileUploadSuccess,
        AuditEventType::FileUploadFailed,
        AuditEventType::FileValidationFailed,
        AuditEventType::FileDeleted,
        AuditEventType::SystemError,
        AuditEventType::ConfigurationChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSuccess => "LOGIN_SUCCESS",
            AuditEventType::LoginFailed => "LOGIN_FAILED",
            AuditEventType::Logout => "LOGOUT",
            AuditEventType::TokenRefresh => "TOKEN_REFRESH",
            AuditEventType::TokenRevoked => "TOKEN_REVOKED",
            AuditEventType::AuthSuccess => "AUTH_SUCCESS",
            AuditEventType::SecurityFailure => "SECURITY_FAILURE",
            AuditEventType::SessionRevoked => "SESSION_REVOKED",
            AuditEventType::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            AuditEventType::IpFlagged => "IP_FLAGGED",
            AuditEventType::IpCleared => "IP_CLEARED",
            AuditEventType::AccessGranted => "ACCESS_GRANTED",
            AuditEventType::AccessDenied => "ACCESS_DENIED",
            AuditEventType::RoleViolation => "ROLE_VIOLATION",
            AuditEventType::PolicyViolation => "POLICY_VIOLATION",
            AuditEventType::PermissionDenied => "PERMISSION_DENIED",
            AuditEventType::DataRead => "DATA_READ",
            AuditEventType::DataWrite => "DATA_WRITE",
            AuditEventType::DataUpdate => "DATA_UPDATE",
            AuditEventType::DataDelete => "DATA_DELETE",
            AuditEventType::DataExport => "DATA_EXPORT",
            AuditEventType::SensitiveDataAccess => "SENSITIVE_DATA_ACCESS",
            AuditEventType::FraudDetected => "FRAUD_DETECTED",
            AuditEventType::AnomalyDetected => "ANOMALY_DETECTED",
            AuditEventType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            AuditEventType::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            AuditEventType::MaliciousFileUpload => "MALICIOUS_FILE_UPLOAD",
            AuditEventType::InjectionAttempt => "INJECTION_ATTEMPT",
            AuditEventType::XssAttempt => "XSS_ATTEMPT",
            AuditEventType::ConsentGranted => "CONSENT_GRANTED",
            AuditEventType::ConsentWithdrawn => "CONSENT_WITHDRAWN",
            AuditEventType::DataDeletionRequested => "DATA_DELETION_REQUESTED",
            AuditEventType::DataDeletionCompleted => "DATA_DELETION_COMPLETED",
            AuditEventType::AccountAnonymized => "ACCOUNT_ANONYMIZED",
            AuditEventType::FileUploadSuccess => "FILE_UPLOAD_SUCCESS",
            AuditEventType::FileUploadFailed => "FILE_UPLOAD_FAILED",
            AuditEventType::FileValidationFailed => "FILE_VALIDATION_FAILED",
            AuditEventType::FileDeleted => "FILE_DELETED",
            AuditEventType::SystemError => "SYSTEM_ERROR",
            AuditEventType::ConfigurationChanged => "CONFIGURATION_CHANGED",
        }
    }

    pub fn category(&self) -> EventCategory {
        use AuditEventType::*;
        match self {
            LoginSuccess | LoginFailed | Logout | TokenRefresh | TokenRevoked | AuthSuccess
            | SecurityFailure | SessionRevoked | FingerprintMismatch => EventCategory::Authentication,
            AccessGranted | AccessDenied | RoleViolation | PolicyViolation | PermissionDenied => {
                EventCategory::Authorization
            }
            DataRead | DataWrite | DataUpdate | DataDelete | DataExport | SensitiveDataAccess => {
                EventCategory::DataAccess
            }
            IpFlagged | IpCleared | FraudDetected | AnomalyDetected | SuspiciousActivity
            | RateLimitExceeded | MaliciousFileUpload | InjectionAttempt | XssAttempt => {
                EventCategory::Security
            }
            ConsentGranted | ConsentWithdrawn | DataDeletionRequested | DataDeletionCompleted
            | AccountAnonymized => EventCategory::Privacy,
            FileUploadSuccess | FileUploadFailed | FileValidationFailed | FileDeleted => {
                EventCategory::FileUpload
            }
            SystemError | ConfigurationChanged => EventCategory::System,
        }
    }

    /// Base severity tier used by risk assessment
    pub fn severity(&self) -> Option<Severity> {
        use AuditEventType::*;
        match self {
            FraudDetected | AnomalyDetected | MaliciousFileUpload | InjectionAttempt
            | XssAttempt | IpFlagged | DataDeletionRequested => Some(Severity::High),
            LoginFailed | SecurityFailure | AccessDenied | RoleViolation | PolicyViolation
            | FileValidationFailed | RateLimitExceeded => Some(Severity::Medium),
            _ => None,
        }
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown audit event type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    Authentication,
    Authorization,
    DataAccess,
    Security,
    Privacy,
    FileUpload,
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Authentication => "AUTHENTICATION",
            EventCategory::Authorization => "AUTHORIZATION",
            EventCategory::DataAccess => "DATA_ACCESS",
            EventCategory::Security => "SECURITY",
            EventCategory::Privacy => "PRIVACY",
            EventCategory::FileUpload => "FILE_UPLOAD",
            EventCategory::System => "SYSTEM",
        }
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTHENTICATION" => Ok(EventCategory::Authentication),
            "AUTHORIZATION" => Ok(EventCategory::Authorization),
            "DATA_ACCESS" => Ok(EventCategory::DataAccess),
            "SECURITY" => Ok(EventCategory::Security),
            "PRIVACY" => Ok(EventCategory::Privacy),
            "FILE_UPLOAD" => Ok(EventCategory::FileUpload),
            "SYSTEM" => Ok(EventCategory::System),
            other => Err(format!("unknown event category: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Blocked,
    Warning,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Blocked => "BLOCKED",
            Outcome::Warning => "WARNING",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Outcome::Success),
            "FAILURE" => Ok(Outcome::Failure),
            "BLOCKED" => Ok(Outcome::Blocked),
            "WARNING" => Ok(Outcome::Warning),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditRiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AuditRiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            75..=u8::MAX => AuditRiskLevel::Critical,
            50..=74 => AuditRiskLevel::High,
            25..=49 => AuditRiskLevel::Medium,
            _ => AuditRiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditRiskLevel::Low => "LOW",
            AuditRiskLevel::Medium => "MEDIUM",
            AuditRiskLevel::High => "HIGH",
            AuditRiskLevel::Critical => "CRITICAL",
        }
    }
}

impl FromStr for AuditRiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(AuditRiskLevel::Low),
            "MEDIUM" => Ok(AuditRiskLevel::Medium),
            "HIGH" => Ok(AuditRiskLevel::High),
            "CRITICAL" => Ok(AuditRiskLevel::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Who performed the action; absent for anonymous or system events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: Uuid,
    pub role: String,
    pub name: Option<String>,
}

impl From<&Identity> for Actor {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id,
            role: identity.role.as_str().to_string(),
            name: Some(identity.name.clone()),
        }
    }
}

/// Structured details, one variant per category of event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetails {
    Authentication {
        code: Option<String>,
        reason: Option<String>,
        token_age_secs: Option<i64>,
        failure_count: Option<u32>,
    },
    Authorization {
        policy: String,
        reason: String,
        route: String,
    },
    Security {
        indicator: String,
        detail: Option<String>,
        anomaly_score: Option<f64>,
    },
    FileUpload {
        original_name: Option<String>,
        secure_filename: Option<String>,
        mime_type: Option<String>,
        size: Option<u64>,
        reason: Option<String>,
    },
    Privacy {
        purpose: String,
        subject_id: Option<Uuid>,
        fields: Vec<String>,
    },
    System {
        message: String,
    },
}

impl AuditDetails {
    pub fn auth_failure(code: &str, failure_count: Option<u32>) -> Self {
        AuditDetails::Authentication {
            code: Some(code.to_string()),
            reason: None,
            token_age_secs: None,
            failure_count,
        }
    }

    pub fn security(indicator: impl Into<String>, detail: Option<String>) -> Self {
        AuditDetails::Security {
            indicator: indicator.into(),
            detail,
            anomaly_score: None,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        AuditDetails::System {
            message: message.into(),
        }
    }
}

/// Situational aggravating factors fed into risk assessment
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiskContext {
    pub repeated_failure: bool,
    pub suspicious_ip: bool,
    pub anomaly_score: Option<f64>,
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub event_category: EventCategory,
    pub actor: Option<Actor>,
    pub action: String,
    pub resource: String,
    pub method: Option<String>,
    pub outcome: Outcome,
    pub status_code: Option<u16>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub risk_level: AuditRiskLevel,
    pub risk_score: u8,
    pub details: AuditDetails,
    pub retention_days: u32,
    pub expires_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn expiry_for(timestamp: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
        timestamp + Duration::days(i64::from(retention_days))
    }
}

/// Event data before id, risk and expiry are assigned
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: AuditEventType,
    pub outcome: Outcome,
    pub action: String,
    pub resource: String,
    pub actor: Option<Actor>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub origin: RequestOrigin,
    pub details: AuditDetails,
    pub risk: RiskContext,
}

impl NewAuditEvent {
    pub fn new(
        event_type: AuditEventType,
        outcome: Outcome,
        action: impl Into<String>,
        resource: impl Into<String>,
        details: AuditDetails,
    ) -> Self {
        Self {
            event_type,
            outcome,
            action: action.into(),
            resource: resource.into(),
            actor: None,
            method: None,
            status_code: None,
            origin: RequestOrigin::default(),
            details,
            risk: RiskContext::default(),
        }
    }

    pub fn actor(mut self, actor: impl Into<Option<Actor>>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn risk(mut self, risk: RiskContext) -> Self {
        self.risk = risk;
        self
    }
}

/// Audit query filters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogFilters {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub category: Option<EventCategory>,
    pub user_id: Option<Uuid>,
    pub outcome: Option<Outcome>,
    pub risk_level: Option<AuditRiskLevel>,
    pub ip_address: Option<String>,
}

impl AuditLogFilters {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.start_time.map_or(true, |t| event.timestamp >= t)
            && self.end_time.map_or(true, |t| event.timestamp <= t)
            && self.event_type.map_or(true, |t| event.event_type == t)
            && self.category.map_or(true, |c| event.event_category == c)
            && self
                .user_id
                .map_or(true, |id| event.actor.as_ref().map(|a| a.user_id) == Some(id))
            && self.outcome.map_or(true, |o| event.outcome == o)
            && self.risk_level.map_or(true, |r| event.risk_level == r)
            && self
                .ip_address
                .as_ref()
                .map_or(true, |ip| event.ip_address.as_deref() == Some(ip.as_str()))
    }
}

/// Paginated audit query result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub logs: Vec<AuditEvent>,
    pub total: i64,
    pub page: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedLoginsByIp {
    pub ip_address: String,
    pub attempts: u64,
    pub last_attempt: DateTime<Utc>,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub window_hours: i64,
    pub total_events: u64,
    pub by_category: BTreeMap<EventCategory, u64>,
    pub by_outcome: BTreeMap<Outcome, u64>,
    pub by_risk_level: BTreeMap<AuditRiskLevel, u64>,
    pub critical_events: u64,
    pub blocked_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_string_roundtrip_is_closed() {
        for event_type in AuditEventType::ALL {
            let parsed: AuditEventType = event_type.as_str().parse().unwrap();
            assert_eq!(parsed, event_type);
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
        assert!("USER_DELETED_EVERYTHING".parse::<AuditEventType>().is_err());
    }

    #[test]
    fn test_categories() {
        assert_eq!(AuditEventType::AuthSuccess.category(), EventCategory::Authentication);
        assert_eq!(AuditEventType::PolicyViolation.category(), EventCategory::Authorization);
        assert_eq!(AuditEventType::IpFlagged.category(), EventCategory::Security);
        assert_eq!(AuditEventType::FileValidationFailed.category(), EventCategory::FileUpload);
    }

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(AuditRiskLevel::from_score(100), AuditRiskLevel::Critical);
        assert_eq!(AuditRiskLevel::from_score(75), AuditRiskLevel::Critical);
        assert_eq!(AuditRiskLevel::from_score(74), AuditRiskLevel::High);
        assert_eq!(AuditRiskLevel::from_score(50), AuditRiskLevel::High);
        assert_eq!(AuditRiskLevel::from_score(49), AuditRiskLevel::Medium);
        assert_eq!(AuditRiskLevel::from_score(25), AuditRiskLevel::Medium);
        assert_eq!(AuditRiskLevel::from_score(24), AuditRiskLevel::Low);
    }

    #[test]
    fn test_details_are_tagged() {
        let details = AuditDetails::Authorization {
            policy: "AntiFraudGuard".to_string(),
            reason: "high risk".to_string(),
            route: "/api/v1/orders/authorize".to_string(),
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["kind"], "authorization");
        assert_eq!(value["policy"], "AntiFraudGuard");
    }

    #[test]
    fn test_expiry_is_timestamp_plus_retention() {
        let ts = Utc::now();
        assert_eq!(AuditEvent::expiry_for(ts, 2555), ts + Duration::days(2555));
    }
}
