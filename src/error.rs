//! 统一错误模型
//! 所有拒绝与错误都渲染为同一个 JSON 信封：
//! `{success:false, message, code, requestId, timestamp}`

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 拒绝码，每个码对应固定的 HTTP 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    MissingToken,
    TokenExpired,
    InvalidToken,
    TokenRevoked,
    UserNotFound,
    AccountSuspended,
    SuspiciousIp,
    RateLimitExceeded,
    FingerprintMismatch,
    InsufficientPermissions,
    PolicyViolation,
    MaliciousInput,
    FileValidationFailed,
    InternalError,
}

impl DenialCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialCode::MissingToken => "MISSING_TOKEN",
            DenialCode::TokenExpired => "TOKEN_EXPIRED",
            DenialCode::InvalidToken => "INVALID_TOKEN",
            DenialCode::TokenRevoked => "TOKEN_REVOKED",
            DenialCode::UserNotFound => "USER_NOT_FOUND",
            DenialCode::AccountSuspended => "ACCOUNT_SUSPENDED",
            DenialCode::SuspiciousIp => "SUSPICIOUS_IP",
            DenialCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            DenialCode::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            DenialCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            DenialCode::PolicyViolation => "POLICY_VIOLATION",
            DenialCode::MaliciousInput => "MALICIOUS_INPUT",
            DenialCode::FileValidationFailed => "FILE_VALIDATION_FAILED",
            DenialCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DenialCode::MissingToken
            | DenialCode::TokenExpired
            | DenialCode::InvalidToken
            | DenialCode::TokenRevoked
            | DenialCode::UserNotFound
            | DenialCode::FingerprintMismatch => StatusCode::UNAUTHORIZED,
            DenialCode::AccountSuspended
            | DenialCode::SuspiciousIp
            | DenialCode::InsufficientPermissions
            | DenialCode::PolicyViolation => StatusCode::FORBIDDEN,
            DenialCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            DenialCode::MaliciousInput | DenialCode::FileValidationFailed => {
                StatusCode::BAD_REQUEST
            }
            DenialCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 面向客户端的固定消息
    pub fn default_message(&self) -> &'static str {
        match self {
            DenialCode::MissingToken => "Authentication token not provided",
            DenialCode::TokenExpired => "Session expired. Please login again.",
            DenialCode::InvalidToken => "Invalid authentication token",
            DenialCode::TokenRevoked => "Session has been terminated",
            DenialCode::UserNotFound => "Account no longer exists",
            DenialCode::AccountSuspended => "Account access has been restricted",
            DenialCode::SuspiciousIp => "Access denied from flagged IP address",
            DenialCode::RateLimitExceeded => "Too many requests",
            DenialCode::FingerprintMismatch => "Session could not be verified",
            DenialCode::InsufficientPermissions => "Access denied",
            DenialCode::PolicyViolation => "Request violates access policy",
            DenialCode::MaliciousInput => "Request contains suspicious content",
            DenialCode::FileValidationFailed => "File validation failed",
            DenialCode::InternalError => "Security verification failed",
        }
    }
}

/// 终止性拒绝，携带请求 ID 与时间戳
#[derive(Debug, Clone)]
pub struct Denial {
    pub code: DenialCode,
    pub message: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// 仅限流拒绝时存在
    pub retry_after_secs: Option<u64>,
}

impl Denial {
    pub fn new(code: DenialCode, request_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            request_id: request_id.into(),
            timestamp,
            retry_after_secs: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request denied: {0}")]
    Denied(Box<Denial>),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Privacy error: {0}")]
    Privacy(#[from] crate::services::privacy_service::PrivacyError),

    #[error("Audit store error: {0}")]
    AuditStore(#[from] crate::repository::audit_repo::AuditStoreError),

    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Denied(denial) => denial.status_code(),
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Privacy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AuditStore(crate::repository::audit_repo::AuditStoreError::Immutable) => {
                StatusCode::CONFLICT
            }
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::AuditStore(_)
            | AppError::AuditWrite(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 错误码字符串
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Denied(denial) => denial.code.as_str(),
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Privacy(_) => "PRIVACY_ERROR",
            AppError::AuditStore(crate::repository::audit_repo::AuditStoreError::Immutable) => {
                "AUDIT_IMMUTABLE"
            }
            _ => "INTERNAL_ERROR",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Denied(denial) => denial.message.clone(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::BadRequest(msg) | AppError::Validation(msg) | AppError::Conflict(msg) => {
                msg.clone()
            }
            AppError::Timeout(_) => "Request timed out".to_string(),
            AppError::Privacy(_) => "Protected data could not be processed".to_string(),
            AppError::AuditStore(crate::repository::audit_repo::AuditStoreError::Immutable) => {
                "Audit events are immutable".to_string()
            }
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::AuditStore(_) | AppError::AuditWrite(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

impl From<Denial> for AppError {
    fn from(denial: Denial) -> Self {
        AppError::Denied(Box::new(denial))
    }
}

/// 错误响应 DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub code: &'static str,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            success: false,
            message: self.message.clone(),
            code: self.code.as_str(),
            request_id: self.request_id.clone(),
            timestamp: self.timestamp,
        };

        let mut response = (self.status_code(), Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Denied(denial) = self {
            return denial.into_response();
        }

        let status = self.status_code();
        let request_id = crate::middleware::current_request_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if status.is_server_error() {
            tracing::error!(code = self.code(), message = %self, request_id = %request_id, "Application error");
        } else {
            tracing::debug!(code = self.code(), message = %self, request_id = %request_id, "Request rejected");
        }

        let body = ErrorResponse {
            success: false,
            message: self.user_message(),
            code: self.code(),
            request_id,
            timestamp: Utc::now(),
        };

        (status, Json(body)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_status_mapping() {
        assert_eq!(DenialCode::MissingToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenialCode::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenialCode::AccountSuspended.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(DenialCode::SuspiciousIp.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(DenialCode::PolicyViolation.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(DenialCode::RateLimitExceeded.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(DenialCode::MaliciousInput.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(DenialCode::InternalError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_denial_sets_retry_after() {
        let denial = Denial::new(DenialCode::RateLimitExceeded, "req-1", Utc::now())
            .with_retry_after(42);
        let response = denial.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let error = AppError::Internal("stack at line 12".to_string());
        assert_eq!(error.user_message(), "Internal server error");
    }
}
