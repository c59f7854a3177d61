//! 文件上传处理器
//! multipart 的每个文件部分先流式写入隔离目录，再交给上传校验器

use crate::{
    auth::gate::AuthContext,
    error::AppError,
    extract::ApiMultipart,
    middleware::AppState,
    models::upload::{QuarantinedUpload, UploadTarget, ValidatedFile},
};
use axum::{
    extract::{multipart::Field, Multipart, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub async fn upload_product_images(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiMultipart(multipart): ApiMultipart,
) -> Result<impl IntoResponse, AppError> {
    handle_upload(&state, &auth, multipart, UploadTarget::Products).await
}

pub async fn upload_profile_image(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ApiMultipart(multipart): ApiMultipart,
) -> Result<impl IntoResponse, AppError> {
    handle_upload(&state, &auth, multipart, UploadTarget::Profiles).await
}

async fn handle_upload(
    state: &AppState,
    auth: &AuthContext,
    mut multipart: Multipart,
    target: UploadTarget,
) -> Result<impl IntoResponse, AppError> {
    let upload_config = &state.config.upload;
    let mut accepted: Vec<ValidatedFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        // 非文件字段忽略
        let Some(original_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        if accepted.len() >= upload_config.max_files_per_request {
            discard_accepted(&accepted).await;
            return Err(AppError::BadRequest(format!(
                "At most {} files per request",
                upload_config.max_files_per_request
            )));
        }

        let declared_mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let (temp_path, size) =
            match quarantine(field, &upload_config.temp_dir, upload_config.max_size_bytes).await {
                Ok(written) => written,
                Err(e) => {
                    discard_accepted(&accepted).await;
                    return Err(e);
                }
            };

        let upload = QuarantinedUpload {
            original_name,
            declared_mime,
            size,
            temp_path,
        };

        match state
            .uploads
            .validate(upload, &auth.identity, target, &auth.context)
            .await
        {
            Ok(file) => accepted.push(file),
            Err(e) => {
                // 一次请求要么全部成功，要么不留下任何文件
                discard_accepted(&accepted).await;
                return Err(e.into_denial(&auth.context.request_id, Utc::now()).into());
            }
        }
    }

    if accepted.is_empty() {
        return Err(AppError::BadRequest("No file uploaded".to_string()));
    }

    Ok(Json(json!({
        "success": true,
        "target": target.as_str(),
        "count": accepted.len(),
        "files": accepted
    })))
}

/// 写入隔离目录，最多写 max_size + 1 字节（足以判定超限）
async fn quarantine(
    mut field: Field<'_>,
    temp_dir: &Path,
    max_size: u64,
) -> Result<(PathBuf, u64), AppError> {
    tokio::fs::create_dir_all(temp_dir)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to prepare quarantine directory: {}", e)))?;

    let temp_path = temp_dir.join(format!("{}.upload", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create quarantine file: {}", e)))?;

    let cap = max_size.saturating_add(1);
    let mut written: u64 = 0;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(AppError::BadRequest(format!("Upload interrupted: {}", e)));
            }
        };

        let remaining = cap - written;
        let take = (chunk.len() as u64).min(remaining) as usize;
        if let Err(e) = file.write_all(&chunk[..take]).await {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AppError::Internal(format!("Failed to write quarantine file: {}", e)));
        }
        written += take as u64;
        if written >= cap {
            break;
        }
    }

    if let Err(e) = file.flush().await {
        drop(file);
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(AppError::Internal(format!("Failed to flush quarantine file: {}", e)));
    }

    Ok((temp_path, written))
}

async fn discard_accepted(accepted: &[ValidatedFile]) {
    for file in accepted {
        if let Err(e) = tokio::fs::remove_file(&file.storage_path).await {
            tracing::warn!(path = %file.storage_path.display(), error = %e, "Failed to roll back stored upload");
        }
    }
}
