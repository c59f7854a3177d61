//! User repository (用户目录)
//! 认证只读取身份；资料视图读取完整记录后交给隐私过滤

use crate::{
    error::AppError,
    models::identity::{AnonymizedUser, Identity, UserRecord},
};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

/// 用户查询能力
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_user(&self, user_id: Uuid) -> Result<Option<Identity>, AppError>;

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<serde_json::Value>, AppError>;

    /// 删除用户记录；不存在时返回 false
    async fn delete_user(&self, user_id: Uuid) -> Result<bool, AppError>;

    /// 用匿名值覆盖姓名与邮箱，清空其余个人字段
    async fn anonymize_user(
        &self,
        user_id: Uuid,
        replacement: &AnonymizedUser,
    ) -> Result<bool, AppError>;
}

pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 根据 ID 查找用户
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, AppError> {
        let user = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name, phone, email, address, upi_id, location, role, verified,
                   risk_level, trust_score, account_status, created_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl UserDirectory for PgUserRepository {
    async fn lookup_user(&self, user_id: Uuid) -> Result<Option<Identity>, AppError> {
        match self.find_by_id(user_id).await? {
            Some(record) => record.to_identity().map(Some).map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Corrupt user record");
                AppError::Internal(e)
            }),
            None => Ok(None),
        }
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<serde_json::Value>, AppError> {
        Ok(self.find_by_id(user_id).await?.map(|r| r.to_profile()))
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn anonymize_user(
        &self,
        user_id: Uuid,
        replacement: &AnonymizedUser,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET name = $2, email = $3, phone = NULL, address = NULL, upi_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(&replacement.name)
        .bind(&replacement.email)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// 内存用户目录
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<Uuid, UserRecord>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: UserRecord) {
        self.users.insert(record.id, record);
    }

    pub fn set_status(&self, user_id: Uuid, status: &str) -> bool {
        match self.users.get_mut(&user_id) {
            Some(mut record) => {
                record.account_status = status.to_string();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn lookup_user(&self, user_id: Uuid) -> Result<Option<Identity>, AppError> {
        match self.users.get(&user_id) {
            Some(record) => record.to_identity().map(Some).map_err(AppError::Internal),
            None => Ok(None),
        }
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<serde_json::Value>, AppError> {
        Ok(self.users.get(&user_id).map(|r| r.to_profile()))
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool, AppError> {
        Ok(self.users.remove(&user_id).is_some())
    }

    async fn anonymize_user(
        &self,
        user_id: Uuid,
        replacement: &AnonymizedUser,
    ) -> Result<bool, AppError> {
        match self.users.get_mut(&user_id) {
            Some(mut record) => {
                record.name = replacement.name.clone();
                record.email = Some(replacement.email.clone());
                record.phone = None;
                record.address = None;
                record.upi_id = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
