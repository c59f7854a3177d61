//! 上传文件校验
//! 隔离目录中的文件依次经过：上传频率、扩展名、MIME、大小、文件头（恶意签名优先）、嵌入脚本扫描，
//! 全部通过后生成安全文件名并移动到目标目录；任何失败都会删除临时文件

use crate::{
    auth::rate_limit::{RateDecision, SlidingWindowLimiter},
    config::AppConfig,
    error::{Denial, DenialCode},
    models::{
        audit::{Actor, AuditDetails, AuditEventType, NewAuditEvent, Outcome},
        context::SecurityContext,
        identity::Identity,
        upload::{QuarantinedUpload, UploadTarget, ValidatedFile},
    },
    services::audit_service::AuditService,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// 明确拒绝的危险扩展名
const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "pif", "scr", "vbs", "js", "jar", "app", "deb", "rpm", "dmg",
    "pkg", "sh", "bash", "php", "asp", "aspx", "jsp", "py", "rb", "pl", "cgi", "dll", "so",
    "dylib", "sys", "drv", "zip", "rar", "7z", "tar", "gz",
];

/// 可执行文件、脚本与压缩包的文件头
const MALICIOUS_SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "windows executable"),
    (b"\x7fELF", "elf executable"),
    (b"#!", "shebang script"),
    (b"PK\x03\x04", "zip archive"),
    (b"Rar!", "rar archive"),
];

const HEADER_LEN: usize = 16;

static EMBEDDED_SCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(<script|<\?php|eval\(|base64_decode|system\(|exec\()")
        .expect("embedded script pattern is valid")
});

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("Upload limit reached. Try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Dangerous file type detected: .{0}")]
    DangerousExtension(String),

    #[error("File type not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("MIME type not allowed: {0}")]
    MimeNotAllowed(String),

    #[error("MIME type {mime} does not match extension .{extension}")]
    MimeMismatch { mime: String, extension: String },

    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("File too small: {size} bytes (min {min})")]
    TooSmall { size: u64, min: u64 },

    #[error("File signature does not match declared type")]
    SignatureMismatch,

    #[error("Malicious file signature detected: {0}")]
    MaliciousSignature(&'static str),

    #[error("Embedded script content detected")]
    EmbeddedScript,

    #[error("Path traversal attempt detected")]
    PathTraversal,

    #[error("Upload storage error: {0}")]
    Storage(String),
}

impl UploadError {
    /// 需要作为恶意上传单独告警的失败
    pub fn is_malicious(&self) -> bool {
        matches!(
            self,
            UploadError::DangerousExtension(_)
                | UploadError::MaliciousSignature(_)
                | UploadError::EmbeddedScript
                | UploadError::PathTraversal
        )
    }

    pub fn reason(&self) -> &'static str {
        match self {
            UploadError::RateLimited { .. } => "rate_limited",
            UploadError::DangerousExtension(_) => "dangerous_extension",
            UploadError::ExtensionNotAllowed(_) => "extension",
            UploadError::MimeNotAllowed(_) | UploadError::MimeMismatch { .. } => "mime",
            UploadError::TooLarge { .. } | UploadError::TooSmall { .. } => "size",
            UploadError::SignatureMismatch => "signature_mismatch",
            UploadError::MaliciousSignature(_) => "malicious_signature",
            UploadError::EmbeddedScript => "embedded_script",
            UploadError::PathTraversal => "path_traversal",
            UploadError::Storage(_) => "storage",
        }
    }

    pub fn into_denial(self, request_id: &str, timestamp: DateTime<Utc>) -> Denial {
        match self {
            UploadError::RateLimited { retry_after_secs } => {
                Denial::new(DenialCode::RateLimitExceeded, request_id, timestamp)
                    .with_message("Too many uploads. Please try again later.")
                    .with_retry_after(retry_after_secs)
            }
            UploadError::Storage(_) => Denial::new(DenialCode::InternalError, request_id, timestamp),
            other => Denial::new(DenialCode::FileValidationFailed, request_id, timestamp)
                .with_message(other.to_string()),
        }
    }
}

/// 扩展名对应的 MIME 类型族
fn mime_family(extension: &str) -> &'static [&'static str] {
    match extension {
        "jpg" | "jpeg" => &["image/jpeg", "image/jpg"],
        "png" => &["image/png"],
        "webp" => &["image/webp"],
        _ => &[],
    }
}

/// 文件头签名校验
fn signature_matches(mime: &str, header: &[u8]) -> bool {
    match mime {
        "image/jpeg" | "image/jpg" => {
            header.len() >= 4
                && header[..3] == [0xFF, 0xD8, 0xFF]
                && matches!(header[3], 0xE0 | 0xE1 | 0xE2 | 0xE3 | 0xDB | 0xEE)
        }
        "image/png" => header.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
        // RIFF....WEBP
        "image/webp" => header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WEBP",
        _ => false,
    }
}

fn file_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn secure_filename(uploader_id: &uuid::Uuid, extension: &str, now: DateTime<Utc>) -> String {
    let user_hash = hex::encode(Sha256::digest(uploader_id.to_string().as_bytes()));
    let random = hex::encode(rand::random::<[u8; 16]>());
    format!(
        "{}_{}_{}.{}",
        now.timestamp_millis(),
        &user_hash[..8],
        random,
        extension
    )
}

pub struct UploadValidator {
    audit: Arc<AuditService>,
    limiter: SlidingWindowLimiter,
    allowed_extensions: Vec<String>,
    allowed_mime_types: Vec<String>,
    min_size: u64,
    max_size: u64,
    products_dir: PathBuf,
    profiles_dir: PathBuf,
}

impl UploadValidator {
    pub fn new(audit: Arc<AuditService>, config: &AppConfig) -> Self {
        Self {
            audit,
            limiter: SlidingWindowLimiter::per_minute(config.upload.uploads_per_minute),
            allowed_extensions: config
                .upload
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            allowed_mime_types: config
                .upload
                .allowed_mime_types
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            min_size: config.upload.min_size_bytes,
            max_size: config.upload.max_size_bytes,
            products_dir: config.upload.products_dir.clone(),
            profiles_dir: config.upload.profiles_dir.clone(),
        }
    }

    pub fn target_dir(&self, target: UploadTarget) -> &Path {
        match target {
            UploadTarget::Products => &self.products_dir,
            UploadTarget::Profiles => &self.profiles_dir,
        }
    }

    /// 清理上传限流窗口
    pub fn sweep(&self) -> usize {
        self.limiter.sweep()
    }

    /// 校验并转存；失败时删除临时文件并写审计
    pub async fn validate(
        &self,
        upload: QuarantinedUpload,
        uploader: &Identity,
        target: UploadTarget,
        context: &SecurityContext,
    ) -> Result<ValidatedFile, UploadError> {
        match self.run_pipeline(&upload, uploader, target).await {
            Ok(file) => {
                tracing::info!(
                    request_id = %context.request_id,
                    user_id = %uploader.user_id,
                    secure_filename = %file.secure_filename,
                    size = file.size,
                    "File upload accepted"
                );
                let event = NewAuditEvent::new(
                    AuditEventType::FileUploadSuccess,
                    Outcome::Success,
                    format!("Upload {} file", target.as_str()),
                    target.as_str(),
                    AuditDetails::FileUpload {
                        original_name: Some(file.original_name.clone()),
                        secure_filename: Some(file.secure_filename.clone()),
                        mime_type: Some(file.mimetype.clone()),
                        size: Some(file.size),
                        reason: None,
                    },
                )
                .actor(Actor::from(uploader))
                .method(context.method.as_str())
                .status(201)
                .origin(context.origin());

                if let Err(e) = self.audit.log(event).await {
                    tracing::error!(error = %e, "Failed to audit upload success");
                }
                Ok(file)
            }
            Err(err) => {
                discard(&upload.temp_path).await;
                self.record_rejection(&upload, uploader, target, context, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        upload: &QuarantinedUpload,
        uploader: &Identity,
        target: UploadTarget,
    ) -> Result<ValidatedFile, UploadError> {
        if let RateDecision::Limited { retry_after_secs } =
            self.limiter.check(&format!("upload:{}", uploader.user_id))
        {
            return Err(UploadError::RateLimited { retry_after_secs });
        }

        // 1. 扩展名
        let extension = file_extension(&upload.original_name).unwrap_or_default();
        if DANGEROUS_EXTENSIONS.contains(&extension.as_str()) {
            return Err(UploadError::DangerousExtension(extension));
        }
        if extension.is_empty() || !self.allowed_extensions.contains(&extension) {
            return Err(UploadError::ExtensionNotAllowed(upload.original_name.clone()));
        }

        // 2. MIME
        let mime = upload.declared_mime.trim().to_ascii_lowercase();
        if !self.allowed_mime_types.contains(&mime) {
            return Err(UploadError::MimeNotAllowed(mime));
        }
        if !mime_family(&extension).contains(&mime.as_str()) {
            return Err(UploadError::MimeMismatch { mime, extension });
        }

        // 3. 大小，以磁盘上的实际大小为准
        let size = tokio::fs::metadata(&upload.temp_path)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?
            .len();
        if size > self.max_size {
            return Err(UploadError::TooLarge { size, max: self.max_size });
        }
        if size < self.min_size {
            return Err(UploadError::TooSmall { size, min: self.min_size });
        }

        // 4. 文件头：可执行文件与压缩包先于类型签名判定，按恶意上传处理
        let header = read_header(&upload.temp_path).await?;
        if let Some((_, kind)) = MALICIOUS_SIGNATURES
            .iter()
            .find(|(sig, _)| header.starts_with(sig))
        {
            return Err(UploadError::MaliciousSignature(kind));
        }
        if !signature_matches(&mime, &header) {
            return Err(UploadError::SignatureMismatch);
        }

        // 5. 嵌入脚本
        let content = tokio::fs::read(&upload.temp_path)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;
        if EMBEDDED_SCRIPT.is_match(&String::from_utf8_lossy(&content)) {
            return Err(UploadError::EmbeddedScript);
        }

        // 6. 安全文件名
        let uploaded_at = Utc::now();
        let filename = secure_filename(&uploader.user_id, &extension, uploaded_at);

        // 7. 路径约束后移动
        let storage_path = self.resolve_within_root(target, &filename).await?;
        move_file(&upload.temp_path, &storage_path).await?;

        Ok(ValidatedFile {
            original_name: upload.original_name.clone(),
            secure_filename: filename,
            mimetype: mime,
            size,
            storage_path,
            uploaded_at,
        })
    }

    /// 目标路径必须位于上传根目录内
    async fn resolve_within_root(
        &self,
        target: UploadTarget,
        filename: &str,
    ) -> Result<PathBuf, UploadError> {
        if filename.contains(|c| c == '/' || c == '\\') || filename.contains("..") {
            return Err(UploadError::PathTraversal);
        }

        let dir = self.target_dir(target);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;
        let root = tokio::fs::canonicalize(dir)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;

        let candidate = root.join(filename);
        if candidate.parent() != Some(root.as_path()) {
            return Err(UploadError::PathTraversal);
        }
        Ok(candidate)
    }

    async fn record_rejection(
        &self,
        upload: &QuarantinedUpload,
        uploader: &Identity,
        target: UploadTarget,
        context: &SecurityContext,
        err: &UploadError,
    ) {
        metrics::counter!("upload_rejections_total", "reason" => err.reason()).increment(1);
        tracing::warn!(
            request_id = %context.request_id,
            user_id = %uploader.user_id,
            original_name = %upload.original_name,
            reason = err.reason(),
            "File upload rejected"
        );

        let details = AuditDetails::FileUpload {
            original_name: Some(upload.original_name.clone()),
            secure_filename: None,
            mime_type: Some(upload.declared_mime.clone()),
            size: Some(upload.size),
            reason: Some(err.to_string()),
        };

        let mut events = vec![AuditEventType::FileValidationFailed];
        if err.is_malicious() {
            events.push(AuditEventType::MaliciousFileUpload);
        }

        for event_type in events {
            let event = NewAuditEvent::new(
                event_type,
                Outcome::Blocked,
                format!("Upload {} file", target.as_str()),
                target.as_str(),
                details.clone(),
            )
            .actor(Actor::from(uploader))
            .method(context.method.as_str())
            .status(400)
            .origin(context.origin());

            if let Err(e) = self.audit.log(event).await {
                tracing::error!(error = %e, "Failed to audit upload rejection");
            }
        }
    }
}

async fn read_header(path: &Path) -> Result<Vec<u8>, UploadError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UploadError::Storage(e.to_string()))?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    (&mut file)
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| UploadError::Storage(e.to_string()))?;
    Ok(header)
}

/// 同一文件系统内原子 rename，跨设备时退化为复制后删除
async fn move_file(from: &Path, to: &Path) -> Result<(), UploadError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| UploadError::Storage(e.to_string()))?;
    discard(from).await;
    Ok(())
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp upload"),
    }
}
