//! 零信任认证门
//! 每个请求独立重新验证，检查顺序固定，任一步失败即终止：
//! 令牌提取 -> 签名与过期 -> 吊销 -> 用户状态 -> 可疑 IP -> 限流 -> 设备指纹 -> 刷新提示

use crate::{
    auth::{
        jwt::{JwtService, TokenError},
        rate_limit::{RateDecision, SlidingWindowLimiter},
        reputation::IpReputation,
        session::{
            device_fingerprint, FingerprintCheck, RevocationRegistry, SessionKey, SessionRegistry,
        },
    },
    config::AppConfig,
    error::{AppError, Denial, DenialCode},
    models::{
        audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome, RiskContext},
        context::{RequestMeta, SecurityContext},
        identity::Identity,
    },
    repository::user_repo::UserDirectory,
    services::audit_service::AuditService,
};
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 认证通过后附加到请求上的结果
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: Identity,
    pub context: SecurityContext,
    pub session: SessionKey,
}

/// 单次认证失败的内部描述
struct Failure {
    code: DenialCode,
    message: Option<String>,
    retry_after_secs: Option<u64>,
    actor: Option<Actor>,
}

impl Failure {
    fn new(code: DenialCode) -> Self {
        Self {
            code,
            message: None,
            retry_after_secs: None,
            actor: None,
        }
    }

    fn actor(mut self, identity: &Identity) -> Self {
        self.actor = Some(Actor::from(identity));
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedIp {
    pub ip: IpAddr,
    pub flagged_at: DateTime<Utc>,
}

/// 管理面板使用的安全指标
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetrics {
    pub active_sessions: usize,
    pub revoked_sessions: usize,
    pub suspicious_ips: Vec<FlaggedIp>,
    pub tracked_rate_limit_keys: usize,
    pub timestamp: DateTime<Utc>,
}

/// 从 Authorization 头提取 Bearer 令牌
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub struct AuthGate {
    jwt: Arc<JwtService>,
    users: Arc<dyn UserDirectory>,
    audit: Arc<AuditService>,
    sessions: Arc<SessionRegistry>,
    revocations: Arc<dyn RevocationRegistry>,
    limiter: SlidingWindowLimiter,
    reputation: IpReputation,
    refresh_window_secs: i64,
    strict_fingerprint: bool,
    lookup_timeout: Duration,
}

impl AuthGate {
    pub fn new(
        config: &AppConfig,
        jwt: Arc<JwtService>,
        users: Arc<dyn UserDirectory>,
        audit: Arc<AuditService>,
    ) -> Self {
        let idle_ttl = Duration::from_secs(config.security.state_ttl_secs);
        let sessions = Arc::new(SessionRegistry::new(
            config.security.access_token_exp_secs,
            idle_ttl,
        ));

        Self {
            jwt,
            users,
            audit,
            revocations: sessions.clone(),
            sessions,
            limiter: SlidingWindowLimiter::per_minute(config.security.max_requests_per_minute),
            reputation: IpReputation::new(config.security.suspicious_ip_threshold, idle_ttl),
            refresh_window_secs: config.security.token_refresh_window_secs,
            strict_fingerprint: config.security.strict_fingerprint,
            lookup_timeout: Duration::from_millis(config.security.user_lookup_timeout_ms),
        }
    }

    /// 替换吊销注册表（多实例部署时接入共享存储）
    pub fn with_revocations(mut self, revocations: Arc<dyn RevocationRegistry>) -> Self {
        self.revocations = revocations;
        self
    }

    /// 认证入口：成功返回身份与安全上下文，失败返回终止性拒绝
    pub async fn authenticate(
        &self,
        meta: &RequestMeta,
        request_id: &str,
    ) -> Result<AuthContext, Denial> {
        let mut context = SecurityContext {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            client_ip: meta.client_ip,
            user_agent: meta.user_agent().map(str::to_string),
            origin: meta.header_str(header::ORIGIN.as_str()).map(str::to_string),
            method: meta.method.to_string(),
            path: meta.path.clone(),
            device_fingerprint: device_fingerprint(&meta.headers),
            token_age_secs: None,
            token_expires_in_secs: None,
            refresh_required: false,
        };

        match self.verify(meta, &mut context).await {
            Ok((identity, session)) => {
                self.reputation.record_success(context.client_ip);
                metrics::counter!("auth_outcomes_total", "code" => "AUTH_SUCCESS").increment(1);
                tracing::debug!(
                    request_id = %context.request_id,
                    user_id = %identity.user_id,
                    client_ip = %context.client_ip,
                    "Request authenticated"
                );

                let event = NewAuditEvent::new(
                    AuditEventType::AuthSuccess,
                    Outcome::Success,
                    "Authenticate request",
                    context.path.clone(),
                    AuditDetails::Authentication {
                        code: None,
                        reason: None,
                        token_age_secs: context.token_age_secs,
                        failure_count: None,
                    },
                )
                .actor(Actor::from(&identity))
                .method(context.method.clone())
                .status(200)
                .origin(context.origin());

                if let Err(e) = self.audit.log_success(event).await {
                    tracing::error!(error = %e, request_id = %context.request_id, "Failed to audit authentication");
                }

                Ok(AuthContext {
                    identity,
                    context,
                    session,
                })
            }
            Err(failure) => Err(self.deny(failure, &context).await),
        }
    }

    async fn verify(
        &self,
        meta: &RequestMeta,
        context: &mut SecurityContext,
    ) -> Result<(Identity, SessionKey), Failure> {
        // 1. 令牌
        let token = extract_token(&meta.headers).ok_or(Failure::new(DenialCode::MissingToken))?;

        // 2. 签名与过期
        let claims = self.jwt.validate_access_token(token).map_err(|e| match e {
            TokenError::Expired => Failure::new(DenialCode::TokenExpired),
            TokenError::Invalid => Failure::new(DenialCode::InvalidToken),
        })?;
        let user_id = claims
            .user_id()
            .ok_or(Failure::new(DenialCode::InvalidToken))?;

        let now = context.timestamp.timestamp();
        context.token_age_secs = Some(now - claims.iat);
        context.token_expires_in_secs = Some(claims.exp - now);
        let session = SessionKey {
            user_id,
            issued_at: claims.iat,
        };

        // 3. 吊销
        if self.revocations.is_token_revoked(user_id, claims.iat).await {
            return Err(Failure::new(DenialCode::TokenRevoked));
        }

        // 4. 用户与账号状态
        let identity = self.lookup(user_id, &context.request_id).await?;
        if !identity.account_status.is_active() {
            return Err(Failure::new(DenialCode::AccountSuspended).actor(&identity));
        }

        // 5. 可疑 IP
        if self.reputation.is_flagged(context.client_ip) {
            return Err(Failure::new(DenialCode::SuspiciousIp).actor(&identity));
        }

        // 6. 限流（ip + 用户）
        let key = format!("{}:{}", context.client_ip, user_id);
        if let RateDecision::Limited { retry_after_secs } = self.limiter.check(&key) {
            return Err(Failure {
                code: DenialCode::RateLimitExceeded,
                message: Some(format!(
                    "Too many requests. Try again in {}s",
                    retry_after_secs
                )),
                retry_after_secs: Some(retry_after_secs),
                actor: Some(Actor::from(&identity)),
            });
        }

        // 7. 设备指纹，默认只记录不拦截
        if self
            .sessions
            .check_fingerprint(session, &context.device_fingerprint)
            == FingerprintCheck::Mismatch
        {
            self.record_fingerprint_mismatch(&identity, context).await;
            if self.strict_fingerprint {
                return Err(Failure::new(DenialCode::FingerprintMismatch).actor(&identity));
            }
        }

        // 8. 临近过期提示刷新
        context.refresh_required = claims.exp - now < self.refresh_window_secs;

        Ok((identity, session))
    }

    async fn lookup(&self, user_id: Uuid, request_id: &str) -> Result<Identity, Failure> {
        match tokio::time::timeout(self.lookup_timeout, self.users.lookup_user(user_id)).await {
            Ok(Ok(Some(identity))) => Ok(identity),
            Ok(Ok(None)) => Err(Failure::new(DenialCode::UserNotFound)),
            Ok(Err(e)) => {
                tracing::error!(error = %e, request_id, user_id = %user_id, "User lookup failed");
                Err(Failure::new(DenialCode::InternalError))
            }
            Err(_) => {
                tracing::error!(
                    request_id,
                    user_id = %user_id,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "User lookup timed out"
                );
                Err(Failure::new(DenialCode::InternalError))
            }
        }
    }

    async fn record_fingerprint_mismatch(&self, identity: &Identity, context: &SecurityContext) {
        tracing::warn!(
            request_id = %context.request_id,
            user_id = %identity.user_id,
            client_ip = %context.client_ip,
            strict = self.strict_fingerprint,
            "Session fingerprint mismatch"
        );

        let event = NewAuditEvent::new(
            AuditEventType::FingerprintMismatch,
            if self.strict_fingerprint {
                Outcome::Blocked
            } else {
                Outcome::Warning
            },
            "Verify session fingerprint",
            context.path.clone(),
            AuditDetails::security(
                "fingerprint_mismatch",
                Some(format!("received {}", context.device_fingerprint)),
            ),
        )
        .actor(Actor::from(identity))
        .method(context.method.clone())
        .origin(context.origin());

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, "Failed to audit fingerprint mismatch");
        }
    }

    /// 记录失败、更新 IP 信誉，返回统一格式的拒绝
    async fn deny(&self, failure: Failure, context: &SecurityContext) -> Denial {
        let ip = context.client_ip;
        let already_flagged = self.reputation.is_flagged(ip);
        let record = self.reputation.record_failure(ip);
        let code = failure.code;

        let mut denial = Denial::new(code, context.request_id.clone(), context.timestamp);
        if let Some(message) = failure.message {
            denial = denial.with_message(message);
        }
        if let Some(secs) = failure.retry_after_secs {
            denial = denial.with_retry_after(secs);
        }

        metrics::counter!("auth_outcomes_total", "code" => code.as_str()).increment(1);
        tracing::warn!(
            request_id = %context.request_id,
            client_ip = %ip,
            code = code.as_str(),
            failure_count = record.count,
            "Authentication failed"
        );

        let event = NewAuditEvent::new(
            AuditEventType::SecurityFailure,
            Outcome::Failure,
            "Authenticate request",
            context.path.clone(),
            AuditDetails::Authentication {
                code: Some(code.as_str().to_string()),
                reason: Some(denial.message.clone()),
                token_age_secs: context.token_age_secs,
                failure_count: Some(record.count),
            },
        )
        .actor(failure.actor.clone())
        .method(context.method.clone())
        .status(code.status_code().as_u16())
        .origin(context.origin())
        .risk(RiskContext {
            repeated_failure: record.count > 1,
            suspicious_ip: already_flagged,
            anomaly_score: None,
        });

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, request_id = %context.request_id, "Failed to audit security failure");
        }

        if record.newly_flagged {
            tracing::warn!(client_ip = %ip, failure_count = record.count, "IP flagged as suspicious");
            let event = NewAuditEvent::new(
                AuditEventType::IpFlagged,
                Outcome::Blocked,
                "Flag suspicious IP",
                ip.to_string(),
                AuditDetails::Security {
                    indicator: "repeated_security_failures".to_string(),
                    detail: Some(format!("{} consecutive failures", record.count)),
                    anomaly_score: None,
                },
            )
            .origin(context.origin())
            .risk(RiskContext {
                repeated_failure: true,
                suspicious_ip: true,
                anomaly_score: None,
            });

            if let Err(e) = self.audit.log(event).await {
                tracing::error!(error = %e, "Failed to audit IP flag");
            }
        }

        denial
    }

    /// 吊销会话（登出或安全事件处置）
    pub async fn revoke_session(
        &self,
        user_id: Uuid,
        issued_at: i64,
        actor: &Identity,
        context: &SecurityContext,
    ) -> bool {
        let revoked = self.revocations.revoke(user_id, issued_at).await;
        tracing::info!(
            request_id = %context.request_id,
            user_id = %user_id,
            issued_at,
            revoked_by = %actor.user_id,
            newly_revoked = revoked,
            "Session revoked"
        );

        let event = NewAuditEvent::new(
            AuditEventType::SessionRevoked,
            Outcome::Success,
            "Revoke session",
            format!("session:{}:{}", user_id, issued_at),
            AuditDetails::Authentication {
                code: None,
                reason: Some(format!("revoked by {}", actor.user_id)),
                token_age_secs: None,
                failure_count: None,
            },
        )
        .actor(Actor::from(actor))
        .method(context.method.clone())
        .origin(context.origin());

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, "Failed to audit session revocation");
        }
        revoked
    }

    /// 令牌续期：换发新的 access 令牌并吊销旧会话。
    /// 新令牌的 iat 至少比旧令牌晚 1 秒，保证两者的会话键不同
    pub async fn refresh_session(&self, auth: &AuthContext) -> Result<String, AppError> {
        let old_iat = auth.session.issued_at;
        let iat = Utc::now().timestamp().max(old_iat + 1);
        let token = self.jwt.issue_token_at(
            &auth.identity.user_id,
            auth.identity.role,
            iat,
            iat + self.jwt.ttl_secs(),
        )?;
        let revoked = self.revocations.revoke(auth.session.user_id, old_iat).await;

        tracing::info!(
            request_id = %auth.context.request_id,
            user_id = %auth.identity.user_id,
            old_issued_at = old_iat,
            issued_at = iat,
            revoked,
            "Session refreshed"
        );

        let event = NewAuditEvent::new(
            AuditEventType::TokenRefresh,
            Outcome::Success,
            "Refresh access token",
            format!("session:{}:{}", auth.session.user_id, old_iat),
            AuditDetails::Authentication {
                code: None,
                reason: Some(format!("reissued with iat {}", iat)),
                token_age_secs: auth.context.token_age_secs,
                failure_count: None,
            },
        )
        .actor(Actor::from(&auth.identity))
        .method(auth.context.method.clone())
        .origin(auth.context.origin());

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, "Failed to audit token refresh");
        }
        Ok(token)
    }

    /// 管理员清除可疑 IP 标记与失败计数
    pub async fn clear_suspicious_ip(
        &self,
        ip: IpAddr,
        actor: &Identity,
        context: &SecurityContext,
    ) -> bool {
        let was_flagged = self.reputation.clear(ip);
        tracing::info!(client_ip = %ip, cleared_by = %actor.user_id, was_flagged, "Suspicious IP cleared");

        let event = NewAuditEvent::new(
            AuditEventType::IpCleared,
            Outcome::Success,
            "Clear suspicious IP",
            ip.to_string(),
            AuditDetails::security("ip_cleared", Some(format!("was_flagged={}", was_flagged))),
        )
        .actor(Actor::from(actor))
        .method(context.method.clone())
        .origin(context.origin());

        if let Err(e) = self.audit.log(event).await {
            tracing::error!(error = %e, "Failed to audit IP clearing");
        }
        was_flagged
    }

    pub fn is_ip_flagged(&self, ip: IpAddr) -> bool {
        self.reputation.is_flagged(ip)
    }

    pub fn security_metrics(&self) -> SecurityMetrics {
        SecurityMetrics {
            active_sessions: self.sessions.active_sessions(),
            revoked_sessions: self.sessions.revoked_sessions(),
            suspicious_ips: self
                .reputation
                .flagged_ips()
                .into_iter()
                .map(|(ip, flagged_at)| FlaggedIp { ip, flagged_at })
                .collect(),
            tracked_rate_limit_keys: self.limiter.tracked_keys(),
            timestamp: Utc::now(),
        }
    }

    /// TTL 清理，返回移除的条目数
    pub fn sweep(&self) -> usize {
        self.limiter.sweep() + self.reputation.sweep() + self.sessions.sweep()
    }
}
