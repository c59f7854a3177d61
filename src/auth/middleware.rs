//! 安全管道中间件
//! 把 axum 请求转换为管道输入，执行认证、完整性与策略阶段

use crate::{
    auth::gate::AuthContext,
    error::{AppError, Denial, DenialCode},
    middleware::{client_ip, AppState, RequestId},
    models::context::RequestMeta,
    pipeline::{AuthStage, Exchange, IntegrityStage, Pipeline, PolicyStage},
    services::{policy_service::Policy, privacy_service::strip_sensitive_params},
};
use axum::{
    body::{to_bytes, Body},
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, uri::PathAndQuery, HeaderValue, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use url::form_urlencoded;
use uuid::Uuid;

/// 非 multipart 请求体的缓冲上限
const BUFFERED_BODY_LIMIT: usize = 1024 * 1024;

pub const TOKEN_REFRESH_HEADER: &str = "x-token-refresh-required";

// 在 handler 中直接提取认证结果
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| AppError::Internal("security pipeline not installed on route".into()))
    }
}

/// 每组路由一个 Guard，持有该组的策略链
pub struct Guard {
    pipeline: Pipeline,
    trust_proxy: bool,
    body_limit: usize,
}

impl Guard {
    /// 认证 -> 完整性检查 -> 策略
    pub fn new(state: &AppState, policies: Vec<Policy>) -> Arc<Self> {
        let pipeline = Pipeline::new()
            .stage(AuthStage::new(state.auth_gate.clone()))
            .stage(IntegrityStage::new(state.audit_service.clone()))
            .stage(PolicyStage::new(
                state.policy_engine.clone(),
                state.anomaly.clone(),
                state.audit_service.clone(),
                policies,
            ));

        Arc::new(Self {
            pipeline,
            trust_proxy: state.config.security.trust_proxy,
            body_limit: BUFFERED_BODY_LIMIT,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// multipart 请求体交给上传校验器流式处理，其余请求体一律缓冲检查
fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false)
}

/// 不依赖 Content-Type 判断：能解析为 JSON 的按 JSON 检查，否则按文本检查
fn inspect_body(bytes: &[u8]) -> Option<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(bytes).into_owned())))
}

/// 用保留的参数重建 URI 的查询串
fn rebuild_query(uri: &Uri, kept: &[(String, String)]) -> Option<Uri> {
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(kept)
        .finish();
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().ok()?);
    Uri::from_parts(parts).ok()
}

/// 安全中间件
/// 任一阶段终止时直接返回统一拒绝响应，下游 handler 不会被调用
pub async fn security_middleware(
    State(guard): State<Arc<Guard>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // 敏感参数不应出现在查询串里（会进入访问日志与代理缓存），下游一律看不到
    let (query_params, stripped) = match req.uri().query() {
        Some(raw) => strip_sensitive_params(
            form_urlencoded::parse(raw.as_bytes()).into_owned().collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    if !stripped.is_empty() {
        tracing::warn!(
            request_id = %request_id,
            params = ?stripped,
            "Sensitive parameters removed from query string"
        );
        match rebuild_query(req.uri(), &query_params) {
            Some(uri) => *req.uri_mut() = uri,
            None => {
                return Denial::new(DenialCode::MaliciousInput, request_id, Utc::now())
                    .with_message("Malformed query string")
                    .into_response();
            }
        }
    }

    let meta = RequestMeta {
        method: req.method().clone(),
        path: req.uri().path().to_string(),
        query: req.uri().query().map(str::to_string),
        client_ip: client_ip(&req, guard.trust_proxy),
        headers: req.headers().clone(),
    };

    let mut exchange = Exchange::new(meta, request_id.clone());
    exchange.query_params = query_params;

    let req = if !is_multipart(&req) {
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, guard.body_limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to buffer request body");
                return Denial::new(DenialCode::MaliciousInput, request_id, Utc::now())
                    .with_message("Request body is too large or unreadable")
                    .into_response();
            }
        };
        exchange.body = inspect_body(&bytes);
        Request::from_parts(parts, Body::from(bytes))
    } else {
        req
    };

    if let Err(denial) = guard.pipeline.dispatch(&mut exchange).await {
        return denial.into_response();
    }

    let Some(auth) = exchange.auth else {
        tracing::error!(request_id = %request_id, "Pipeline finished without identity");
        return Denial::new(DenialCode::InternalError, request_id, Utc::now()).into_response();
    };

    let refresh_required = auth.context.refresh_required;
    let mut req = req;
    req.extensions_mut().insert(auth);

    let mut response = next.run(req).await;
    if refresh_required {
        response
            .headers_mut()
            .insert(TOKEN_REFRESH_HEADER, HeaderValue::from_static("true"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_query_keeps_remaining_pairs() {
        let uri: Uri = "/api/v1/users/1/profile?purpose=profile_view&pin=1234&note=a%20b"
            .parse()
            .unwrap();
        let kept = vec![
            ("purpose".to_string(), "profile_view".to_string()),
            ("note".to_string(), "a b".to_string()),
        ];

        let rebuilt = rebuild_query(&uri, &kept).unwrap();
        assert_eq!(rebuilt.path(), "/api/v1/users/1/profile");
        assert_eq!(rebuilt.query(), Some("purpose=profile_view&note=a+b"));

        let bare = rebuild_query(&uri, &[]).unwrap();
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn test_inspect_body_falls_back_to_text() {
        assert_eq!(inspect_body(b"  \n"), None);
        assert_eq!(inspect_body(br#"{"a":1}"#), Some(serde_json::json!({"a": 1})));
        assert_eq!(
            inspect_body(b"a=<script>"),
            Some(Value::String("a=<script>".to_string()))
        );
    }
}
