//! Upload domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upload destination directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadTarget {
    Products,
    Profiles,
}

impl UploadTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTarget::Products => "products",
            UploadTarget::Profiles => "profiles",
        }
    }
}

/// A multipart part already written to the quarantine directory
#[derive(Debug, Clone)]
pub struct QuarantinedUpload {
    pub original_name: String,
    pub declared_mime: String,
    pub size: u64,
    pub temp_path: PathBuf,
}

/// File that passed every validation step and now lives under the upload root
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedFile {
    pub original_name: String,
    pub secure_filename: String,
    pub mimetype: String,
    pub size: u64,
    #[serde(skip)]
    pub storage_path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}
