//! 数据库模型

use chrono::{DateTime, Utc};
use lis_core::models::*;
use lis_core::LisError;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库设备表
#[derive(Debug, FromRow)]
pub struct DbDevice {
    pub id: String,
    pub name: String,
    pub protocol: String, // 存储为字符串，转换为Protocol枚举
    pub state: String,
    pub transport: serde_json::Value,
    pub parameter_mappings: serde_json::Value,
    pub results_received: i64,
    pub last_connection: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: i64,
}

impl TryFrom<DbDevice> for Device {
    type Error = LisError;

    fn try_from(db_device: DbDevice) -> Result<Self, Self::Error> {
        let protocol = db_device.protocol.parse::<Protocol>()?;
        let state = match db_device.state.as_str() {
            "active" => DeviceState::Active,
            _ => DeviceState::Inactive,
        };

        Ok(Device {
            id: db_device.id,
            name: db_device.name,
            protocol,
            state,
            transport: serde_json::from_value(db_device.transport)?,
            parameter_mappings: serde_json::from_value(db_device.parameter_mappings)?,
            telemetry: DeviceTelemetry {
                results_received: db_device.results_received.max(0) as u64,
                last_connection: db_device.last_connection,
                last_result: db_device.last_result,
                last_error: db_device.last_error,
                error_count: db_device.error_count.max(0) as u64,
            },
        })
    }
}

/// 数据库患者表（只读）
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            external_id: db_patient.external_id,
            name: db_patient.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_device(protocol: &str) -> DbDevice {
        DbDevice {
            id: "bc6800".to_string(),
            name: "Mindray BC-6800".to_string(),
            protocol: protocol.to_string(),
            state: "active".to_string(),
            transport: json!({"type": "tcp_client", "host": "10.0.0.5", "port": 5100}),
            parameter_mappings: json!([
                {"equipment_code": "WBC", "parameter_name": "Leucocitos", "factor": 1.0, "decimals": 1, "unit": "10^3/uL", "reference_range": "4.0-10.0"}
            ]),
            results_received: 12,
            last_connection: None,
            last_result: None,
            last_error: Some("timeout".to_string()),
            error_count: 2,
        }
    }

    #[test]
    fn test_db_device_conversion() {
        let device = Device::try_from(db_device("ASTM")).unwrap();
        assert_eq!(device.protocol, Protocol::Astm);
        assert!(device.is_active());
        assert_eq!(
            device.transport,
            TransportSettings::TcpClient { host: "10.0.0.5".to_string(), port: 5100 }
        );
        assert_eq!(device.parameter_mappings[0].decimals, 1);
        assert_eq!(device.telemetry.results_received, 12);
        assert_eq!(device.telemetry.error_count, 2);
    }

    #[test]
    fn test_db_device_unknown_protocol() {
        let result = Device::try_from(db_device("MODBUS"));
        assert!(matches!(result, Err(LisError::UnsupportedProtocol(p)) if p == "MODBUS"));
    }
}
