//! Identity domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Marketplace role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Farmer,
    Buyer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Farmer => "farmer",
            Role::Buyer => "buyer",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "farmer" => Ok(Role::Farmer),
            "buyer" => Ok(Role::Buyer),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Banned,
}

impl AccountStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AccountStatus::Active)
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "banned" => Ok(AccountStatus::Banned),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// Verified identity, read-only after lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
    pub verified: bool,
    pub risk_level: RiskLevel,
    /// 0-100
    pub trust_score: u8,
    pub account_status: AccountStatus,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// 匿名化后写回用户表的替代值
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnonymizedUser {
    pub name: String,
    pub email: String,
}

/// Raw users row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub upi_id: Option<String>,
    pub location: Option<String>,
    pub role: String,
    pub verified: bool,
    pub risk_level: String,
    pub trust_score: i16,
    pub account_status: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn to_identity(&self) -> Result<Identity, String> {
        Ok(Identity {
            user_id: self.id,
            name: self.name.clone(),
            role: self.role.parse()?,
            verified: self.verified,
            risk_level: self.risk_level.parse()?,
            trust_score: self.trust_score.clamp(0, 100) as u8,
            account_status: self.account_status.parse()?,
        })
    }

    /// Profile payload handed to the privacy filter
    pub fn to_profile(&self) -> serde_json::Value {
        serde_json::json!({
            "userId": self.id,
            "name": self.name,
            "phone": self.phone,
            "email": self.email,
            "address": self.address,
            "upiId": self.upi_id,
            "location": self.location,
            "role": self.role,
            "verified": self.verified,
            "trustScore": self.trust_score,
            "createdAt": self.created_at,
        })
    }
}
