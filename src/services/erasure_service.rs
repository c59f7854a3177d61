//! 账号数据导出、删除与匿名化
//!
//! 删除分两步：申请时签发一次性删除令牌（只保存其 SHA-256），
//! 确认时核对令牌后删除用户记录。审计事件不随用户删除，按各自保留期清理。

use crate::{
    config::AppConfig,
    error::AppError,
    models::{
        audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome},
        context::SecurityContext,
        identity::{AnonymizedUser, Identity, RiskLevel, Role},
    },
    repository::user_repo::UserDirectory,
    services::{
        audit_service::AuditService, cipher_service::FieldCipher, privacy_service::PrivacyFilter,
        privacy_service::Purpose,
    },
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// 导出时附带的最近审计记录条数
const EXPORT_TIMELINE_LIMIT: u32 = 50;

const DELETION_TOKEN_BYTES: usize = 32;

/// 数据处理目的说明，随导出一并返回
const PROCESSING_PURPOSES: &[&str] = &[
    "Account management",
    "Transaction processing",
    "Order fulfillment",
    "Analytics (anonymized)",
    "ML model training (anonymized)",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityIssue {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionEligibility {
    pub can_delete: bool,
    pub issues: Vec<EligibilityIssue>,
}

/// 删除申请回执；令牌只在这里出现一次，须在 scheduled_date 之前确认
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionTicket {
    pub deletion_token: String,
    pub scheduled_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingDeletion {
    token_hash: String,
    requested_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    reason: String,
}

pub struct ErasureService {
    users: Arc<dyn UserDirectory>,
    cipher: Arc<FieldCipher>,
    privacy: Arc<PrivacyFilter>,
    audit: Arc<AuditService>,
    pending: DashMap<Uuid, PendingDeletion>,
    grace_period: Duration,
}

impl ErasureService {
    pub fn new(
        config: &AppConfig,
        users: Arc<dyn UserDirectory>,
        cipher: Arc<FieldCipher>,
        privacy: Arc<PrivacyFilter>,
        audit: Arc<AuditService>,
    ) -> Self {
        Self {
            users,
            cipher,
            privacy,
            audit,
            pending: DashMap::new(),
            grace_period: Duration::days(i64::from(config.security.deletion_grace_days)),
        }
    }

    /// 管理员账号与处于风险审查中的账号不能自助删除
    pub fn eligibility(&self, identity: &Identity) -> DeletionEligibility {
        let mut issues = Vec::new();
        if identity.role == Role::Admin {
            issues.push(EligibilityIssue {
                kind: "admin_account",
                message: "Administrator accounts must be removed by another administrator",
            });
        }
        if identity.risk_level == RiskLevel::High {
            issues.push(EligibilityIssue {
                kind: "under_review",
                message: "Account is under security review",
            });
        }

        DeletionEligibility {
            can_delete: issues.is_empty(),
            issues,
        }
    }

    /// 创建删除申请；重复申请会替换之前的令牌
    pub async fn request_deletion(
        &self,
        identity: &Identity,
        reason: Option<String>,
        context: &SecurityContext,
    ) -> Result<DeletionTicket, AppError> {
        let eligibility = self.eligibility(identity);
        if !eligibility.can_delete {
            let kinds: Vec<&str> = eligibility.issues.iter().map(|i| i.kind).collect();
            return Err(AppError::Conflict(format!(
                "Account cannot be deleted at this time: {}",
                kinds.join(", ")
            )));
        }

        let mut raw = [0u8; DELETION_TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let now = Utc::now();
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "user_request".to_string());
        let ticket = PendingDeletion {
            token_hash: token_digest(&token),
            requested_at: now,
            scheduled_for: now + self.grace_period,
            reason: reason.clone(),
        };
        let scheduled_for = ticket.scheduled_for;
        self.pending.insert(identity.user_id, ticket);

        tracing::info!(
            request_id = %context.request_id,
            user_id = %identity.user_id,
            scheduled_for = %scheduled_for,
            "Account deletion requested"
        );

        let event = self.event(
            AuditEventType::DataDeletionRequested,
            "Request account deletion",
            identity,
            context,
            AuditDetails::System {
                message: format!("reason={}", reason),
            },
        );
        self.audit.log(event).await?;

        Ok(DeletionTicket {
            deletion_token: token,
            scheduled_date: scheduled_for,
        })
    }

    /// 核对删除令牌并删除账号
    pub async fn confirm_deletion(
        &self,
        identity: &Identity,
        token: &str,
        context: &SecurityContext,
    ) -> Result<Value, AppError> {
        let digest = token_digest(token.trim());
        let ticket = self
            .pending
            .remove_if(&identity.user_id, |_, pending| pending.token_hash == digest)
            .map(|(_, pending)| pending)
            .ok_or_else(|| AppError::BadRequest("Invalid or expired deletion token".to_string()))?;

        if !self.users.delete_user(identity.user_id).await? {
            return Err(AppError::not_found(&format!("user {}", identity.user_id)));
        }

        let completed_at = Utc::now();
        tracing::info!(
            request_id = %context.request_id,
            user_id = %identity.user_id,
            "Account deleted"
        );

        let event = self.event(
            AuditEventType::DataDeletionCompleted,
            "Delete account",
            identity,
            context,
            AuditDetails::System {
                message: format!(
                    "requested_at={} reason={}",
                    ticket.requested_at.to_rfc3339(),
                    ticket.reason
                ),
            },
        );
        self.audit.log(event).await?;

        Ok(json!({
            "userId": identity.user_id,
            "requestedAt": ticket.requested_at,
            "completedAt": completed_at,
            "retained": ["audit_events"],
        }))
    }

    /// 以不可逆的替代值覆盖可识别字段，账号本身保留
    pub async fn anonymize(
        &self,
        identity: &Identity,
        context: &SecurityContext,
    ) -> Result<AnonymizedUser, AppError> {
        let replacement = self.replacement_for(identity.user_id);
        if !self
            .users
            .anonymize_user(identity.user_id, &replacement)
            .await?
        {
            return Err(AppError::not_found(&format!("user {}", identity.user_id)));
        }
        self.pending.remove(&identity.user_id);

        tracing::info!(
            request_id = %context.request_id,
            user_id = %identity.user_id,
            "Account anonymized"
        );

        let event = self.event(
            AuditEventType::AccountAnonymized,
            "Anonymize account",
            identity,
            context,
            AuditDetails::Privacy {
                purpose: Purpose::ProfileView.as_str().to_string(),
                subject_id: Some(identity.user_id),
                fields: vec![
                    "name".into(),
                    "email".into(),
                    "phone".into(),
                    "address".into(),
                    "upiId".into(),
                ],
            },
        );
        self.audit.log(event).await?;

        Ok(replacement)
    }

    fn replacement_for(&self, user_id: Uuid) -> AnonymizedUser {
        let digest = self.privacy.pseudonymize(&user_id.to_string());
        let short = &digest[..8];
        AnonymizedUser {
            name: format!("User_{}", short),
            email: format!("deleted_{}@anonymized.local", short),
        }
    }

    /// 导出本人数据：解密后的资料（高敏字段仍脱敏）与最近的审计记录
    pub async fn export(
        &self,
        identity: &Identity,
        context: &SecurityContext,
        encrypted_fields: &[&str],
    ) -> Result<Value, AppError> {
        let profile = self
            .users
            .fetch_profile(identity.user_id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("user {}", identity.user_id)))?;
        let profile = self.cipher.decrypt_fields(&profile, encrypted_fields)?;
        let profile = self.privacy.filter(&profile, Purpose::ProfileView, true);

        let activity: Vec<Value> = self
            .audit
            .user_timeline(identity.user_id, EXPORT_TIMELINE_LIMIT)
            .await?
            .into_iter()
            .map(|event| {
                json!({
                    "timestamp": event.timestamp,
                    "eventType": event.event_type,
                    "action": event.action,
                    "outcome": event.outcome,
                })
            })
            .collect();

        let fields: Vec<String> = match &profile {
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        };

        let event = self.event(
            AuditEventType::DataExport,
            "Export personal data",
            identity,
            context,
            AuditDetails::Privacy {
                purpose: Purpose::ProfileView.as_str().to_string(),
                subject_id: Some(identity.user_id),
                fields,
            },
        );
        self.audit.log(event).await?;

        Ok(json!({
            "exportDate": Utc::now(),
            "userId": identity.user_id,
            "profile": profile,
            "recentActivity": activity,
            "dataProcessingPurposes": PROCESSING_PURPOSES,
            "dataRetentionPolicy": {
                "personalData": "Deleted upon request",
                "auditEvents": "Retained per event retention period",
                "anonymizedData": "Indefinite (for analytics)",
            },
        }))
    }

    pub fn has_pending_deletion(&self, user_id: Uuid) -> bool {
        self.pending.contains_key(&user_id)
    }

    /// 清理超过确认期限仍未确认的申请
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.scheduled_for > now);
        before.saturating_sub(self.pending.len())
    }

    fn event(
        &self,
        event_type: AuditEventType,
        action: &str,
        identity: &Identity,
        context: &SecurityContext,
        details: AuditDetails,
    ) -> NewAuditEvent {
        NewAuditEvent::new(
            event_type,
            Outcome::Success,
            action,
            format!("user:{}", identity.user_id),
            details,
        )
        .actor(Actor::from(identity))
        .method(context.method.clone())
        .status(200)
        .origin(context.origin())
    }
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
