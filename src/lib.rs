//! 市场安全网关库
//! 零信任认证、策略评估、审计日志、隐私过滤与上传校验

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
