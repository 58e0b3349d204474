//! # LIS数据库模块
//!
//! 负责设备、患者查询与检验结果的存储，提供PostgreSQL实现和用于开发测试的内存实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::{MemoryStore, SeedData};
pub use models::*;
pub use queries::PostgresStore;
