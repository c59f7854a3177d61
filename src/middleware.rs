//! HTTP 中间件
//! 应用状态、请求追踪、客户端 IP 解析

use crate::{
    auth::{anomaly::AnomalyTracker, gate::AuthGate, jwt::JwtService},
    config::AppConfig,
    error::AppError,
    repository::{audit_repo::AuditStore, user_repo::UserDirectory},
    services::{
        AuditService, ErasureService, FieldCipher, PolicyEngine, PrivacyFilter, UploadValidator,
    },
};
use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use sqlx::PgPool;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// 应用状态
///
/// 服务均以 Arc 共享，内部的可变状态（限流窗口、IP 信誉、会话指纹）
/// 由各服务自行同步。`db` 为 None 时以纯内存模式运行（测试与单进程部署）。
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Option<PgPool>,
    pub jwt_service: Arc<JwtService>,
    pub users: Arc<dyn UserDirectory>,
    pub audit_service: Arc<AuditService>,
    pub auth_gate: Arc<AuthGate>,
    pub policy_engine: Arc<PolicyEngine>,
    pub privacy: Arc<PrivacyFilter>,
    pub cipher: Arc<FieldCipher>,
    pub uploads: Arc<UploadValidator>,
    pub anomaly: Arc<AnomalyTracker>,
    pub erasure: Arc<ErasureService>,
}

impl AppState {
    /// 组装所有服务
    pub fn build(
        config: AppConfig,
        db: Option<PgPool>,
        users: Arc<dyn UserDirectory>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Result<Self, AppError> {
        let jwt_service = Arc::new(JwtService::from_config(&config)?);
        let audit_service = Arc::new(AuditService::new(audit_store, &config));
        let auth_gate = Arc::new(AuthGate::new(
            &config,
            jwt_service.clone(),
            users.clone(),
            audit_service.clone(),
        ));
        let policy_engine = Arc::new(PolicyEngine::new(audit_service.clone(), &config));
        let privacy = Arc::new(PrivacyFilter::from_config(&config));
        let cipher = Arc::new(FieldCipher::new(&config.security.encryption_secret)?);
        let uploads = Arc::new(UploadValidator::new(audit_service.clone(), &config));
        let anomaly = Arc::new(AnomalyTracker::new(Duration::from_secs(
            config.security.state_ttl_secs,
        )));
        let erasure = Arc::new(ErasureService::new(
            &config,
            users.clone(),
            cipher.clone(),
            privacy.clone(),
            audit_service.clone(),
        ));

        Ok(Self {
            config,
            db,
            jwt_service,
            users,
            audit_service,
            auth_gate,
            policy_engine,
            privacy,
            cipher,
            uploads,
            anomaly,
            erasure,
        })
    }

    /// 清理所有内存状态中的过期条目
    pub fn sweep(&self) -> usize {
        self.auth_gate.sweep() + self.uploads.sweep() + self.anomaly.sweep() + self.erasure.sweep()
    }
}

/// 请求 ID（由追踪中间件写入请求扩展，审计事件以此关联）
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

tokio::task_local! {
    static CURRENT_REQUEST_ID: String;
}

/// 当前请求的 ID；不在请求处理范围内时返回 None
pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// 上游传入的关联 ID 最长接受 128 字节
const MAX_CORRELATION_LEN: usize = 128;

/// 每个请求一个 span；响应带回 x-request-id，以及上游传入或新生成的 x-trace-id
pub async fn request_tracking_middleware(mut req: Request, next: Next) -> Response {
    let trace_id = inbound_trace_id(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let span = tracing::info_span!(
        "request",
        %trace_id,
        %request_id,
        method = %method,
        path = %req.uri().path(),
    );

    let started = Instant::now();
    let mut response = CURRENT_REQUEST_ID
        .scope(request_id.clone(), next.run(req).instrument(span.clone()))
        .await;
    let elapsed = started.elapsed();
    let status = response.status();

    metrics::counter!(
        "http_requests_total",
        "method" => method_label(&method),
        "class" => status_class(status.as_u16()),
    )
    .increment(1);
    metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

    span.in_scope(|| {
        tracing::info!(
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request finished"
        )
    });

    let headers = response.headers_mut();
    for (name, value) in [("x-trace-id", &trace_id), ("x-request-id", &request_id)] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    response
}

fn inbound_trace_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-trace-id")?.to_str().ok()?;
    (!raw.is_empty() && raw.len() <= MAX_CORRELATION_LEN).then(|| raw.to_string())
}

/// 指标标签必须是有限集合
fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        _ => "OTHER",
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// 获取客户端 IP 地址
///
/// 默认只用连接地址。`trust_proxy` 打开时取 X-Forwarded-For 的最后一个地址
/// （由最近一层代理追加，客户端自带的前缀无法伪造它），其次 X-Real-IP。
pub fn client_ip(req: &Request, trust_proxy: bool) -> IpAddr {
    let headers = req.headers();

    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.rsplit(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_inbound_trace_id_bounds() {
        let mut headers = HeaderMap::new();
        assert_eq!(inbound_trace_id(&headers), None);

        headers.insert("x-trace-id", "upstream-42".parse().unwrap());
        assert_eq!(inbound_trace_id(&headers).as_deref(), Some("upstream-42"));

        headers.insert("x-trace-id", "a".repeat(129).parse().unwrap());
        assert_eq!(inbound_trace_id(&headers), None);
    }

    #[tokio::test]
    async fn test_request_id_visible_inside_scope_only() {
        assert_eq!(current_request_id(), None);
        let seen = CURRENT_REQUEST_ID
            .scope("req-7".to_string(), async { current_request_id() })
            .await;
        assert_eq!(seen.as_deref(), Some("req-7"));
    }

    #[test]
    fn test_metric_labels_are_bounded() {
        assert_eq!(method_label(&Method::OPTIONS), "OTHER");
        assert_eq!(status_class(429), "4xx");
        assert_eq!(status_class(503), "5xx");
    }

    #[test]
    fn test_client_ip_resolution() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        // 客户端伪造的前缀被忽略
        assert_eq!(client_ip(&req, true), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&req, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let mut req = Request::builder()
            .header("x-forwarded-for", "not-an-ip")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, true), "198.51.100.2".parse::<IpAddr>().unwrap());

        req.extensions_mut()
            .insert(ConnectInfo("192.0.2.10:4000".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_ip(&req, false), "192.0.2.10".parse::<IpAddr>().unwrap());
    }
}
