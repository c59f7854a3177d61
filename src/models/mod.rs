//! 数据模型模块

pub mod audit;
pub mod context;
pub mod identity;
pub mod upload;
