//! 会话状态：吊销注册表与设备指纹
//! 会话以（用户 ID，令牌签发时间）标识

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: Uuid,
    pub issued_at: i64,
}

/// 令牌吊销的协作接口，多实例部署时可替换为共享存储
#[async_trait]
pub trait RevocationRegistry: Send + Sync {
    async fn is_token_revoked(&self, user_id: Uuid, issued_at: i64) -> bool;

    /// 会话此前已被吊销时返回 false
    async fn revoke(&self, user_id: Uuid, issued_at: i64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// 会话首个请求，记录指纹
    Established,
    Matched,
    Mismatch,
}

#[derive(Debug, Clone)]
struct FingerprintEntry {
    hash: String,
    last_seen: Instant,
}

/// 进程内会话注册表
pub struct SessionRegistry {
    fingerprints: DashMap<SessionKey, FingerprintEntry>,
    /// 已吊销会话，值为令牌自然过期的时刻
    revoked: DashMap<SessionKey, DateTime<Utc>>,
    token_lifetime: ChronoDuration,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(token_lifetime_secs: u64, idle_ttl: Duration) -> Self {
        Self {
            fingerprints: DashMap::new(),
            revoked: DashMap::new(),
            token_lifetime: ChronoDuration::seconds(token_lifetime_secs as i64),
            idle_ttl,
        }
    }

    pub fn check_fingerprint(&self, key: SessionKey, fingerprint: &str) -> FingerprintCheck {
        let now = Instant::now();
        let mut established = false;
        let mut entry = self.fingerprints.entry(key).or_insert_with(|| {
            established = true;
            FingerprintEntry {
                hash: fingerprint.to_string(),
                last_seen: now,
            }
        });
        entry.last_seen = now;

        if established {
            FingerprintCheck::Established
        } else if entry.hash == fingerprint {
            FingerprintCheck::Matched
        } else {
            FingerprintCheck::Mismatch
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn revoked_sessions(&self) -> usize {
        self.revoked.len()
    }

    /// 清理空闲指纹与令牌已过期的吊销记录
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let wall_now = Utc::now();
        let before = self.fingerprints.len() + self.revoked.len();

        self.fingerprints
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < self.idle_ttl);
        self.revoked.retain(|_, dead_after| *dead_after > wall_now);

        before.saturating_sub(self.fingerprints.len() + self.revoked.len())
    }
}

#[async_trait]
impl RevocationRegistry for SessionRegistry {
    async fn is_token_revoked(&self, user_id: Uuid, issued_at: i64) -> bool {
        self.revoked.contains_key(&SessionKey { user_id, issued_at })
    }

    async fn revoke(&self, user_id: Uuid, issued_at: i64) -> bool {
        let key = SessionKey { user_id, issued_at };
        let dead_after = DateTime::<Utc>::from_timestamp(issued_at, 0)
            .map(|iat| iat + self.token_lifetime)
            .unwrap_or_else(|| Utc::now() + self.token_lifetime);

        self.fingerprints.remove(&key);
        self.revoked.insert(key, dead_after).is_none()
    }
}

/// 对同一设备上保持稳定的请求头取 SHA-256
pub fn device_fingerprint(headers: &HeaderMap) -> String {
    let read = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let material = format!(
        "{}|{}|{}",
        read(header::USER_AGENT),
        read(header::ACCEPT_LANGUAGE),
        read(header::ACCEPT_ENCODING)
    );

    hex::encode(Sha256::digest(material.as_bytes()))
}
