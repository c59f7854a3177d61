//! 用户资料的隐私视图

use crate::{
    auth::gate::AuthContext,
    error::{AppError, Denial, DenialCode},
    extract::{ApiPath, ApiQuery},
    middleware::AppState,
    models::audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome},
    services::privacy_service::Purpose,
};
use axum::{
    extract::State,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// 静态加密存储的资料字段
pub const ENCRYPTED_PROFILE_FIELDS: &[&str] = &["address", "upiId"];

#[derive(Debug, Deserialize)]
pub struct ProfileQuery {
    pub purpose: Option<String>,
}

/// 按用途过滤后的用户资料
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<ProfileQuery>,
) -> Result<impl IntoResponse, AppError> {
    let purpose = match query.purpose.as_deref() {
        None => Purpose::ProfileView,
        Some(raw) => raw.parse::<Purpose>().map_err(AppError::Validation)?,
    };

    let is_owner = auth.identity.user_id == user_id;
    if !purpose.permitted_for(auth.identity.is_admin(), is_owner) {
        tracing::warn!(
            request_id = %auth.context.request_id,
            user_id = %auth.identity.user_id,
            subject_id = %user_id,
            purpose = purpose.as_str(),
            "Profile purpose not granted"
        );
        let reason = format!("Purpose '{}' is not permitted for this caller", purpose.as_str());
        let event = NewAuditEvent::new(
            AuditEventType::AccessDenied,
            Outcome::Blocked,
            "Read user profile",
            format!("user:{}", user_id),
            AuditDetails::Authorization {
                policy: "PurposeGrant".to_string(),
                reason: reason.clone(),
                route: format!("GET /api/v1/users/{}/profile", user_id),
            },
        )
        .actor(Actor::from(&auth.identity))
        .method("GET")
        .status(403)
        .origin(auth.context.origin());
        if let Err(e) = state.audit_service.log(event).await {
            tracing::error!(error = %e, request_id = %auth.context.request_id, "Failed to audit purpose denial");
        }

        return Err(Denial::new(
            DenialCode::InsufficientPermissions,
            auth.context.request_id.clone(),
            auth.context.timestamp,
        )
        .with_message(reason)
        .into());
    }

    let profile = state
        .users
        .fetch_profile(user_id)
        .await?
        .ok_or_else(|| AppError::not_found(&format!("user {}", user_id)))?;

    let profile = state.cipher.decrypt_fields(&profile, ENCRYPTED_PROFILE_FIELDS)?;

    let filtered = state.privacy.filter(&profile, purpose, is_owner);

    let fields: Vec<String> = match &filtered {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.clone())
            .collect(),
        _ => Vec::new(),
    };

    tracing::debug!(
        request_id = %auth.context.request_id,
        user_id = %auth.identity.user_id,
        subject_id = %user_id,
        purpose = purpose.as_str(),
        is_owner,
        "Profile read"
    );

    let event = NewAuditEvent::new(
        AuditEventType::DataRead,
        Outcome::Success,
        "Read user profile",
        format!("user:{}", user_id),
        AuditDetails::Privacy {
            purpose: purpose.as_str().to_string(),
            subject_id: Some(user_id),
            fields,
        },
    )
    .actor(Actor::from(&auth.identity))
    .method("GET")
    .status(200)
    .origin(auth.context.origin());
    state.audit_service.log_success(event).await?;

    Ok(Json(json!({
        "success": true,
        "purpose": purpose.as_str(),
        "data": filtered
    })))
}
