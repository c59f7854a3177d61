//! HTTP 处理器模块

pub mod audit;
pub mod health;
pub mod orders;
pub mod privacy;
pub mod profile;
pub mod security;
pub mod upload;
