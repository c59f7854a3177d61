//! Database repository layer

pub mod audit_repo;
pub mod memory_audit_repo;
pub mod user_repo;

pub use audit_repo::{AuditStore, AuditStoreError, PgAuditStore};
pub use memory_audit_repo::InMemoryAuditStore;
pub use user_repo::{InMemoryUserDirectory, PgUserRepository, UserDirectory};
