//! 本人数据权利：导出、删除、匿名化

use crate::{
    auth::gate::AuthContext, error::AppError, extract::ApiJson,
    handlers::profile::ENCRYPTED_PROFILE_FIELDS, middleware::AppState,
};
use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct DeletionRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDeletionRequest {
    #[validate(length(min = 1, max = 128))]
    pub deletion_token: String,
}

/// 导出本人数据
pub async fn export_data(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let data = state
        .erasure
        .export(&auth.identity, &auth.context, ENCRYPTED_PROFILE_FIELDS)
        .await?;

    Ok(Json(json!({
        "success": true,
        "downloadFormat": "JSON",
        "data": data,
    })))
}

pub async fn deletion_eligibility(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let eligibility = state.erasure.eligibility(&auth.identity);

    Ok(Json(json!({
        "success": true,
        "canDelete": eligibility.can_delete,
        "issues": eligibility.issues,
        "pendingRequest": state.erasure.has_pending_deletion(auth.identity.user_id),
    })))
}

/// 申请删除账号，返回一次性删除令牌
pub async fn request_deletion(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiJson(request): ApiJson<DeletionRequest>,
) -> Result<impl IntoResponse, AppError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let ticket = state
        .erasure
        .request_deletion(&auth.identity, request.reason, &auth.context)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Deletion request created. Confirm with the deletion token before the scheduled date.",
        "deletionToken": ticket.deletion_token,
        "scheduledDate": ticket.scheduled_date,
    })))
}

/// 确认删除；成功后当前令牌随账号一起失效
pub async fn confirm_deletion(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiJson(request): ApiJson<ConfirmDeletionRequest>,
) -> Result<impl IntoResponse, AppError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let report = state
        .erasure
        .confirm_deletion(&auth.identity, &request.deletion_token, &auth.context)
        .await?;
    state
        .auth_gate
        .revoke_session(
            auth.session.user_id,
            auth.session.issued_at,
            &auth.identity,
            &auth.context,
        )
        .await;

    Ok(Json(json!({
        "success": true,
        "message": "Your account and personal data have been permanently deleted",
        "report": report,
    })))
}

pub async fn anonymize_account(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let replacement = state
        .erasure
        .anonymize(&auth.identity, &auth.context)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Your account has been anonymized",
        "name": replacement.name,
        "email": replacement.email,
    })))
}
