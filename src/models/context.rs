//! 请求级安全上下文

use axum::http::{header, HeaderMap, Method};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// 认证所需的原始请求信息
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub client_ip: IpAddr,
    pub headers: HeaderMap,
}

impl RequestMeta {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header_str(header::USER_AGENT.as_str())
    }
}

/// 每个请求创建一次，之后只读
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub method: String,
    pub path: String,
    pub device_fingerprint: String,
    /// 令牌签发至今的秒数
    pub token_age_secs: Option<i64>,
    /// 距离令牌过期的秒数
    pub token_expires_in_secs: Option<i64>,
    pub refresh_required: bool,
}

/// 审计事件的来源字段
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl SecurityContext {
    pub fn origin(&self) -> RequestOrigin {
        RequestOrigin {
            ip_address: Some(self.client_ip.to_string()),
            user_agent: self.user_agent.clone(),
            request_id: Some(self.request_id.clone()),
        }
    }
}

impl RequestMeta {
    pub fn origin(&self, request_id: &str) -> RequestOrigin {
        RequestOrigin {
            ip_address: Some(self.client_ip.to_string()),
            user_agent: self.user_agent().map(str::to_string),
            request_id: Some(request_id.to_string()),
        }
    }
}
