//! 安全服务层

pub mod audit_service;
pub mod cipher_service;
pub mod erasure_service;
pub mod policy_service;
pub mod privacy_service;
pub mod upload_service;

pub use audit_service::AuditService;
pub use cipher_service::FieldCipher;
pub use erasure_service::ErasureService;
pub use policy_service::{Policy, PolicyDecision, PolicyEngine, RouteMetadata};
pub use privacy_service::{PrivacyError, PrivacyFilter, Purpose};
pub use upload_service::{UploadError, UploadValidator};
