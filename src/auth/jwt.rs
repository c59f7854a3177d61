//! 访问令牌签发与校验
//!
//! 只签发 HS256 access 令牌；续期时用仍有效的 access 令牌换发新令牌，
//! 不单独签发刷新令牌。`typ` 不是 access 的令牌反序列化即失败。
//! 过期校验不留 leeway，`exp` 到点即失效；调用方通过 [`TokenError`]
//! 区分过期与其他无效情况。

use crate::{config::AppConfig, error::AppError, models::identity::Role};
use chrono::Utc;
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    /// 签发时的角色，仅供参考；以用户目录中的角色为准
    pub role: String,
    #[serde(rename = "typ")]
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    fn access(user_id: &Uuid, role: Role, iat: i64, exp: i64) -> Self {
        Self {
            sub: user_id.to_string(),
            role: role.as_str().to_string(),
            kind: TokenKind::Access,
            iat,
            exp,
            jti: Uuid::new_v4().to_string(),
        }
    }

    /// `sub` 不是 UUID 时返回 None
    pub fn user_id(&self) -> Option<Uuid> {
        self.sub.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        }
    }
}

pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl JwtService {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let secret = config.security.jwt_secret.expose_secret().as_bytes();
        if secret.len() < MIN_SECRET_LEN {
            return Err(AppError::Config(format!(
                "JWT secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "iat", "exp"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: config.security.access_token_exp_secs as i64,
        })
    }

    /// 令牌有效期（秒）
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn issue_access_token(&self, user_id: &Uuid, role: Role) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        self.issue_token_at(user_id, role, now, now + self.ttl_secs)
    }

    /// 指定 iat/exp 签发，用于回放与测试
    pub fn issue_token_at(
        &self,
        user_id: &Uuid,
        role: Role,
        iat: i64,
        exp: i64,
    ) -> Result<String, AppError> {
        let claims = Claims::access(user_id, role, iat, exp);
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(
            |e| {
                tracing::error!(error = %e, "Access token encoding failed");
                AppError::Internal("token encoding failed".to_string())
            },
        )
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .inspect_err(|e| tracing::debug!(error = %e, "Token rejected"))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn service() -> JwtService {
        std::env::set_var("GUARD_DATABASE__URL", "postgresql://localhost/test");
        let config = AppConfig::from_env().unwrap();
        std::env::remove_var("GUARD_DATABASE__URL");
        JwtService::from_config(&config).unwrap()
    }

    #[test]
    #[serial]
    fn test_access_token_carries_subject_and_lifetime() {
        let service = service();
        let user_id = Uuid::new_v4();

        let token = service.issue_access_token(&user_id, Role::Buyer).unwrap();
        let claims = service.validate_access_token(&token).unwrap();

        assert_eq!(claims.user_id(), Some(user_id));
        assert_eq!(claims.role, "buyer");
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    #[serial]
    fn test_expired_token_is_distinguished() {
        let service = service();
        let now = Utc::now().timestamp();
        let token = service
            .issue_token_at(&Uuid::new_v4(), Role::Farmer, now - 7200, now - 3600)
            .unwrap();

        assert_eq!(service.validate_access_token(&token), Err(TokenError::Expired));
    }

    #[test]
    #[serial]
    fn test_non_access_token_type_is_not_accepted() {
        let service = service();
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "sub": Uuid::new_v4().to_string(),
            "role": "buyer",
            "typ": "refresh",
            "iat": now,
            "exp": now + 600,
            "jti": Uuid::new_v4().to_string(),
        });
        let token = jsonwebtoken::encode(&Header::default(), &claims, &service.encoding).unwrap();

        assert_eq!(service.validate_access_token(&token), Err(TokenError::Invalid));
    }

    #[test]
    #[serial]
    fn test_garbage_and_tampered_tokens_are_invalid() {
        let service = service();
        assert_eq!(service.validate_access_token("not-a-jwt"), Err(TokenError::Invalid));

        let token = service.issue_access_token(&Uuid::new_v4(), Role::Admin).unwrap();
        let sig_start = token.rfind('.').unwrap() + 1;
        let mut bytes = token.into_bytes();
        let target = sig_start + 10;
        bytes[target] = if bytes[target] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert_eq!(service.validate_access_token(&tampered), Err(TokenError::Invalid));
    }
}
