//! 数据库连接管理

use lis_core::{LisError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// 数据库连接池
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// 连接PostgreSQL
    pub async fn connect(url: &str, max_connections: u32, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(|e| LisError::Persistence(format!("数据库连接失败: {}", e)))?;

        tracing::info!("Database pool ready (max_connections={})", max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
