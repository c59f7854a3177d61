//! 按访问用途过滤隐私数据
//!
//! 字段是否可见由访问用途决定。高敏字段在任何用途下都脱敏，本人也不例外；
//! 分析类用途只拿得到匿名化记录。

use crate::config::AppConfig;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error("Data encryption failed")]
    Encryption,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Data decryption failed")]
    Decryption,

    #[error("Field '{field}' is not accessible for purpose '{purpose}'")]
    FieldAccess { field: String, purpose: String },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// 字段分级（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    HighlySensitive,
    PersonalIdentifiable,
    BusinessSensitive,
    Public,
}

impl FieldClass {
    /// 按字段名匹配，忽略大小写、`_` 与 `-`
    pub fn classify(field: &str) -> Self {
        match normalize(field).as_str() {
            "password" | "bankaccount" | "cardnumber" | "cvv" | "pin" | "aadhaar" | "pan" => {
                FieldClass::HighlySensitive
            }
            "phone" | "email" | "address" | "upiid" => FieldClass::PersonalIdentifiable,
            "price" | "totalprice" | "bidamount" | "paymentdetails" => {
                FieldClass::BusinessSensitive
            }
            _ => FieldClass::Public,
        }
    }
}

fn normalize(field: &str) -> String {
    field
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Authentication,
    ProfileView,
    Transaction,
    Analytics,
    MlTraining,
    Audit,
    Support,
    Admin,
}

/// 非本人在某用途下可见的字段
enum FieldScope {
    Fields(&'static [&'static str]),
    Wildcard,
    AnonymizedOnly,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Authentication => "authentication",
            Purpose::ProfileView => "profile_view",
            Purpose::Transaction => "transaction",
            Purpose::Analytics => "analytics",
            Purpose::MlTraining => "ml_training",
            Purpose::Audit => "audit",
            Purpose::Support => "support",
            Purpose::Admin => "admin",
        }
    }

    /// 用途由服务端按调用方身份授予，而不是由请求方自选：
    /// 通配和客服用途仅限管理员；认证、交易用途只能读取自己的资料（管理员除外）
    pub fn permitted_for(&self, is_admin: bool, is_owner: bool) -> bool {
        match self {
            Purpose::Admin | Purpose::Audit | Purpose::Support => is_admin,
            Purpose::Authentication | Purpose::Transaction => is_admin || is_owner,
            Purpose::ProfileView | Purpose::Analytics | Purpose::MlTraining => true,
        }
    }

    fn scope(&self) -> FieldScope {
        match self {
            Purpose::Authentication => FieldScope::Fields(&["phone", "email", "password"]),
            Purpose::ProfileView => FieldScope::Fields(&[
                "userId", "name", "phone", "email", "location", "role", "userType",
            ]),
            Purpose::Transaction => FieldScope::Fields(&[
                "userId",
                "name",
                "phone",
                "email",
                "address",
                "price",
                "totalPrice",
            ]),
            Purpose::Support => {
                FieldScope::Fields(&["userId", "name", "phone", "email", "role", "userType"])
            }
            Purpose::Analytics | Purpose::MlTraining => FieldScope::AnonymizedOnly,
            Purpose::Audit | Purpose::Admin => FieldScope::Wildcard,
        }
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authentication" => Ok(Purpose::Authentication),
            "profile_view" => Ok(Purpose::ProfileView),
            "transaction" => Ok(Purpose::Transaction),
            "analytics" => Ok(Purpose::Analytics),
            "ml_training" => Ok(Purpose::MlTraining),
            "audit" => Ok(Purpose::Audit),
            "support" => Ok(Purpose::Support),
            "admin" => Ok(Purpose::Admin),
            _ => Err(format!("Unknown purpose: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Phone,
    Email,
    Card,
    Account,
    NationalId,
    Price,
    Secret,
    Generic,
}

impl MaskKind {
    pub fn for_field(field: &str) -> Self {
        let name = normalize(field);
        match name.as_str() {
            "password" | "cvv" | "pin" | "otp" => MaskKind::Secret,
            "aadhaar" | "pan" => MaskKind::NationalId,
            _ if name.contains("phone") => MaskKind::Phone,
            _ if name.contains("email") => MaskKind::Email,
            _ if name.contains("card") => MaskKind::Card,
            _ if name.contains("account") => MaskKind::Account,
            _ if name.contains("price") => MaskKind::Price,
            _ => MaskKind::Generic,
        }
    }
}

fn last_chars(chars: &[char], n: usize) -> String {
    chars[chars.len().saturating_sub(n)..].iter().collect()
}

/// 按字段类型脱敏
pub fn mask(value: &str, kind: MaskKind) -> String {
    let chars: Vec<char> = value.chars().collect();
    match kind {
        MaskKind::Phone => {
            if chars.len() >= 10 {
                format!("XXXX-XX-{}", last_chars(&chars, 4))
            } else {
                "XXXX-XXXX".to_string()
            }
        }
        MaskKind::Email => match value.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                let first = local.chars().next().map(String::from).unwrap_or_default();
                format!("{}***@{}", first, domain)
            }
            _ => mask(value, MaskKind::Generic),
        },
        MaskKind::Card => {
            if chars.len() >= 4 {
                format!("XXXX-XXXX-XXXX-{}", last_chars(&chars, 4))
            } else {
                "XXXX-XXXX-XXXX-XXXX".to_string()
            }
        }
        MaskKind::Account => {
            if chars.len() >= 4 {
                format!("XXXXXXXX{}", last_chars(&chars, 4))
            } else {
                "XXXXXXXXXXXX".to_string()
            }
        }
        MaskKind::NationalId => {
            if chars.len() >= 4 {
                format!("XXXX-XXXX-{}", last_chars(&chars, 4))
            } else {
                "XXXX-XXXX-XXXX".to_string()
            }
        }
        MaskKind::Price => "₹XX,XXX".to_string(),
        MaskKind::Secret => "********".to_string(),
        MaskKind::Generic => {
            if chars.len() > 2 {
                format!(
                    "{}{}{}",
                    chars[0],
                    "*".repeat(chars.len() - 2),
                    chars[chars.len() - 1]
                )
            } else {
                "***".to_string()
            }
        }
    }
}

/// 写日志前需要遮盖的键
const LOG_REDACTED_KEYS: &[&str] = &[
    "password",
    "phone",
    "email",
    "bankaccount",
    "upiid",
    "aadhaar",
    "pan",
    "cardnumber",
    "cvv",
    "pin",
    "otp",
];

/// 不允许出现在查询串中的参数
const SENSITIVE_QUERY_PARAMS: &[&str] = &["password", "pin", "cvv", "cardnumber"];

/// 剔除查询串里的敏感参数（键名忽略大小写、`_` 与 `-`），返回保留的参数与被剔除的键名
pub fn strip_sensitive_params(
    pairs: Vec<(String, String)>,
) -> (Vec<(String, String)>, Vec<String>) {
    let (stripped, kept): (Vec<_>, Vec<_>) = pairs
        .into_iter()
        .partition(|(key, _)| SENSITIVE_QUERY_PARAMS.contains(&normalize(key).as_str()));
    (kept, stripped.into_iter().map(|(key, _)| key).collect())
}

pub struct PrivacyFilter {
    salt: Secret<String>,
}

impl PrivacyFilter {
    pub fn new(salt: Secret<String>) -> Self {
        Self { salt }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.security.anonymization_salt.clone())
    }

    /// 按用途过滤响应数据；数组逐项处理
    pub fn filter(&self, data: &Value, purpose: Purpose, is_owner: bool) -> Value {
        match data {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.filter(item, purpose, is_owner))
                    .collect(),
            ),
            Value::Object(map) => {
                if matches!(purpose.scope(), FieldScope::AnonymizedOnly) {
                    return self.anonymize(data);
                }
                if is_owner {
                    return Value::Object(mask_highly_sensitive(map));
                }
                match purpose.scope() {
                    FieldScope::Wildcard => Value::Object(mask_highly_sensitive(map)),
                    FieldScope::Fields(allowed) => {
                        let kept: Map<String, Value> = map
                            .iter()
                            .filter(|(k, _)| allowed.contains(&k.as_str()))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        Value::Object(mask_highly_sensitive(&kept))
                    }
                    FieldScope::AnonymizedOnly => self.anonymize(data),
                }
            }
            Value::Null => Value::Null,
            // 标量没有字段名，无法分类，一律不透传
            _ if is_owner => data.clone(),
            _ => Value::Null,
        }
    }

    /// 匿名化：标识字段替换为加盐哈希，仅保留非识别字段
    pub fn anonymize(&self, record: &Value) -> Value {
        let Value::Object(map) = record else {
            return Value::Null;
        };

        let text = |key: &str| -> Option<String> {
            match map.get(key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            }
        };

        let mut out = Map::new();
        if let Some(id) = text("userId").or_else(|| text("id")) {
            out.insert("anonymousId".into(), Value::String(self.pseudonymize(&id)));
        }
        for key in ["role", "userType", "location", "createdAt"] {
            if let Some(v) = map.get(key) {
                if !v.is_null() {
                    out.insert(key.into(), v.clone());
                }
            }
        }
        if let Some(phone) = text("phone") {
            out.insert("anonymousPhone".into(), Value::String(self.pseudonymize(&phone)));
        }
        if let Some(email) = text("email") {
            out.insert("anonymousEmail".into(), Value::String(self.pseudonymize(&email)));
        }
        if let Some(name) = text("name") {
            let digest = self.pseudonymize(&name);
            out.insert("anonymousName".into(), Value::String(format!("User_{}", &digest[..8])));
        }

        Value::Object(out)
    }

    /// 加盐 SHA-256，截取 16 位十六进制
    pub fn pseudonymize(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.expose_secret().as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(16);
        digest
    }

    pub fn is_field_access_allowed(&self, field: &str, purpose: Purpose) -> bool {
        match purpose.scope() {
            FieldScope::Wildcard => true,
            FieldScope::AnonymizedOnly => false,
            FieldScope::Fields(allowed) => allowed.contains(&field),
        }
    }

    pub fn check_field_access(&self, field: &str, purpose: Purpose) -> Result<(), PrivacyError> {
        if self.is_field_access_allowed(field, purpose) {
            Ok(())
        } else {
            Err(PrivacyError::FieldAccess {
                field: field.to_string(),
                purpose: purpose.as_str().to_string(),
            })
        }
    }
}

/// 递归脱敏，用于写日志
pub fn sanitize_for_logging(data: &Value) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if LOG_REDACTED_KEYS.contains(&normalize(k).as_str()) {
                        (k.clone(), Value::String("[REDACTED]".into()))
                    } else {
                        (k.clone(), sanitize_for_logging(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_for_logging).collect()),
        other => other.clone(),
    }
}

fn mask_highly_sensitive(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::Null => Value::Null,
                _ if FieldClass::classify(k) == FieldClass::HighlySensitive => {
                    let raw = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Value::String(mask(&raw, MaskKind::for_field(k)))
                }
                Value::Object(inner) => Value::Object(mask_highly_sensitive(inner)),
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::Object(inner) => Value::Object(mask_highly_sensitive(inner)),
                            other => other.clone(),
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
            (k.clone(), value)
        })
        .collect()
}
