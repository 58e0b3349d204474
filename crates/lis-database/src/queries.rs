//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use async_trait::async_trait;
use lis_core::{
    Device, DeviceDirectory, LisError, Patient, PatientDirectory, Result, ResultRecord,
    ResultStore, TelemetryUpdate,
};
use sqlx::types::Json;
use uuid::Uuid;

const DEVICE_COLUMNS: &str = "id, name, protocol, state, transport, parameter_mappings, \
     results_received, last_connection, last_result, last_error, error_count";

/// 基于PostgreSQL的设备目录、患者目录与结果存储
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: DatabasePool,
}

impl PostgresStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 设备表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS devices (
                id VARCHAR(64) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                protocol VARCHAR(16) NOT NULL,
                state VARCHAR(16) NOT NULL DEFAULT 'active',
                transport JSONB NOT NULL DEFAULT '{"type": "none"}',
                parameter_mappings JSONB NOT NULL DEFAULT '[]',
                results_received BIGINT NOT NULL DEFAULT 0,
                last_connection TIMESTAMP WITH TIME ZONE,
                last_result TIMESTAMP WITH TIME ZONE,
                last_error TEXT,
                error_count BIGINT NOT NULL DEFAULT 0
            )
        "#).execute(pool).await.map_err(|e| LisError::Persistence(e.to_string()))?;

        // 患者表由宿主系统维护，这里只保证查询所需的列存在
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                external_id VARCHAR(64) UNIQUE NOT NULL,
                name VARCHAR(255) NOT NULL
            )
        "#).execute(pool).await.map_err(|e| LisError::Persistence(e.to_string()))?;

        // 检验结果表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS device_results (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL REFERENCES patients(id),
                device_id VARCHAR(64) NOT NULL REFERENCES devices(id),
                result_values JSONB NOT NULL,
                validation_state VARCHAR(32) NOT NULL DEFAULT 'pending_validation',
                received_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#).execute(pool).await.map_err(|e| LisError::Persistence(e.to_string()))?;

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_devices_state ON devices(state)",
            "CREATE INDEX IF NOT EXISTS idx_device_results_patient_id ON device_results(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_device_results_device_id ON device_results(device_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(|e| LisError::Persistence(e.to_string()))?;
        }

        tracing::info!("Database tables created successfully");
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for PostgresStore {
    async fn list_active_ids(&self) -> Result<Vec<String>> {
        let pool = self.pool.pool();

        sqlx::query_scalar::<_, String>("SELECT id FROM devices WHERE state = 'active' ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(|e| LisError::Persistence(e.to_string()))
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let pool = self.pool.pool();

        let result = sqlx::query_as::<_, DbDevice>(&format!(
            "SELECT {} FROM devices WHERE id = $1",
            DEVICE_COLUMNS
        ))
        .bind(device_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| LisError::Persistence(e.to_string()))?;

        result.map(Device::try_from).transpose()
    }

    async fn update_telemetry(&self, device_id: &str, update: TelemetryUpdate) -> Result<()> {
        let pool = self.pool.pool();

        let query = match &update {
            TelemetryUpdate::ResultReceived { at } => sqlx::query(r#"
                UPDATE devices
                SET last_connection = $2,
                    results_received = results_received + 1,
                    last_result = $2
                WHERE id = $1
            "#)
            .bind(device_id)
            .bind(*at),
            TelemetryUpdate::Failure { message, .. } => sqlx::query(r#"
                UPDATE devices
                SET last_error = $2,
                    error_count = error_count + 1
                WHERE id = $1
            "#)
            .bind(device_id)
            .bind(message.as_str()),
        };

        let outcome = query
            .execute(pool)
            .await
            .map_err(|e| LisError::Persistence(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(LisError::NotFound(format!("设备 {}", device_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl PatientDirectory for PostgresStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Patient>> {
        let pool = self.pool.pool();

        let result = sqlx::query_as::<_, DbPatient>(
            "SELECT id, external_id, name FROM patients WHERE external_id = $1"
        )
        .bind(external_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| LisError::Persistence(e.to_string()))?;

        Ok(result.map(Patient::from))
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn create_result(&self, record: &ResultRecord) -> Result<Uuid> {
        let pool = self.pool.pool();

        sqlx::query_scalar::<_, Uuid>(r#"
            INSERT INTO device_results (id, patient_id, device_id, result_values, validation_state, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
        "#)
        .bind(record.id)
        .bind(record.patient_id)
        .bind(&record.device_id)
        .bind(Json(&record.values))
        .bind(record.validation_state.as_str())
        .bind(record.received_at)
        .fetch_one(pool)
        .await
        .map_err(|e| LisError::Persistence(e.to_string()))
    }
}
