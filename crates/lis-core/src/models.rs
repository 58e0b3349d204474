//! 核心数据模型定义

use crate::error::LisError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// 设备通信协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Astm,
    Hl7,
    Serial,
    Tcp,
    File,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Astm => "ASTM",
            Protocol::Hl7 => "HL7",
            Protocol::Serial => "SERIAL",
            Protocol::Tcp => "TCP",
            Protocol::File => "FILE",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ASTM" => Ok(Protocol::Astm),
            "HL7" => Ok(Protocol::Hl7),
            "SERIAL" => Ok(Protocol::Serial),
            "TCP" => Ok(Protocol::Tcp),
            "FILE" => Ok(Protocol::File),
            other => Err(LisError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// 设备启用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Inactive,
}

/// 参数映射条目：设备检验代码 → 标准临床参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub equipment_code: String,
    pub parameter_name: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
}

/// 未配置映射时的换算系数
pub const DEFAULT_FACTOR: f64 = 1.0;
/// 未配置映射时保留的小数位数
pub const DEFAULT_DECIMALS: u32 = 2;

fn default_factor() -> f64 {
    DEFAULT_FACTOR
}

fn default_decimals() -> u32 {
    DEFAULT_DECIMALS
}

/// 设备运行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub results_received: u64,
    pub last_connection: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u64,
}

/// 遥测字段的局部更新
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    /// 成功保存一条结果
    ResultReceived { at: DateTime<Utc> },
    /// 处理失败
    Failure { message: String, at: DateTime<Utc> },
}

impl DeviceTelemetry {
    /// 将局部更新应用到内存中的统计
    pub fn apply(&mut self, update: &TelemetryUpdate) {
        match update {
            TelemetryUpdate::ResultReceived { at } => {
                self.last_connection = Some(*at);
                self.results_received += 1;
                self.last_result = Some(*at);
            }
            TelemetryUpdate::Failure { message, .. } => {
                self.last_error = Some(message.clone());
                self.error_count += 1;
            }
        }
    }
}

/// 串口校验位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// 设备传输配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSettings {
    /// 无主动传输，只接受外部推送的消息
    #[default]
    None,
    /// 主动连接仪器或串口服务器
    TcpClient { host: String, port: u16 },
    /// 监听端口，由仪器连入
    TcpServer {
        #[serde(default = "default_bind")]
        bind: String,
        port: u16,
    },
    /// RS-232串口
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// 结果文件投递目录
    Directory {
        path: PathBuf,
        #[serde(default)]
        extension: Option<String>,
        #[serde(default)]
        processed_dir: Option<PathBuf>,
    },
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// 检验设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub state: DeviceState,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub parameter_mappings: Vec<ParameterMapping>, // 有序，重复代码时第一条生效
    #[serde(default)]
    pub telemetry: DeviceTelemetry,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.state == DeviceState::Active
    }

    /// 查找第一条匹配的参数映射
    pub fn find_mapping(&self, equipment_code: &str) -> Option<&ParameterMapping> {
        self.parameter_mappings
            .iter()
            .find(|m| m.equipment_code == equipment_code)
    }
}

/// 患者身份
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub external_id: String, // 身份证号等外部标识
    pub name: String,
}

/// 运行时连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// 连接快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub device_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub status: ConnectionStatus,
}

/// 设备原始消息
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub device_id: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(device_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            device_id: device_id.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// 按文本解读消息内容，非法UTF-8字节以替换字符代替
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 临床标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClinicalFlag {
    Normal,
    High,
    Low,
}

impl ClinicalFlag {
    /// 仪器异常标志映射：`N` 正常，`H` 偏高，其余（包括缺失）一律偏低
    pub fn from_flag_code(code: &str) -> Self {
        match code {
            "N" => ClinicalFlag::Normal,
            "H" => ClinicalFlag::High,
            _ => ClinicalFlag::Low,
        }
    }
}

/// 映射前的单项结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub equipment_code: String,
    pub raw_value: String,
    pub raw_unit: String,
    pub raw_flag_code: String,
}

impl ParsedResult {
    pub fn flag(&self) -> ClinicalFlag {
        ClinicalFlag::from_flag_code(&self.raw_flag_code)
    }
}

/// 一条消息解析后的结果集合，归属于单一患者
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub patient_external_id: String,
    pub results: Vec<ParsedResult>,
}

impl ParsedMessage {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// 映射后的结果值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedResultValue {
    pub parameter_name: String,
    pub value: String, // 固定小数位的字符串
    pub unit: String,
    pub reference_range: Option<String>,
    pub flag: ClinicalFlag,
}

/// 结果审核状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    PendingValidation,
    Validated,
    Rejected,
}

impl ValidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationState::PendingValidation => "pending_validation",
            ValidationState::Validated => "validated",
            ValidationState::Rejected => "rejected",
        }
    }
}

/// 已保存的检验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub device_id: String,
    pub values: Vec<MappedResultValue>,
    pub validation_state: ValidationState,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_mapping_is_literal() {
        assert_eq!(ClinicalFlag::from_flag_code("N"), ClinicalFlag::Normal);
        assert_eq!(ClinicalFlag::from_flag_code("H"), ClinicalFlag::High);
        assert_eq!(ClinicalFlag::from_flag_code("L"), ClinicalFlag::Low);
        assert_eq!(ClinicalFlag::from_flag_code(""), ClinicalFlag::Low);
        assert_eq!(ClinicalFlag::from_flag_code("n"), ClinicalFlag::Low);
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("HL7".parse::<Protocol>().unwrap(), Protocol::Hl7);
        assert!(matches!(
            "MODBUS".parse::<Protocol>(),
            Err(LisError::UnsupportedProtocol(p)) if p == "MODBUS"
        ));
    }

    #[test]
    fn test_device_deserialize_defaults() {
        let json = r#"{
            "id": "bs200",
            "name": "Mindray BS-200",
            "protocol": "ASTM",
            "state": "active",
            "parameter_mappings": [
                {"equipment_code": "GLU", "parameter_name": "Glucosa", "unit": "mg/dL", "reference_range": null}
            ]
        }"#;

        let device: Device = serde_json::from_str(json).unwrap();
        assert!(device.is_active());
        assert_eq!(device.transport, TransportSettings::None);
        let mapping = device.find_mapping("GLU").unwrap();
        assert_eq!(mapping.factor, DEFAULT_FACTOR);
        assert_eq!(mapping.decimals, DEFAULT_DECIMALS);
        assert_eq!(device.telemetry.results_received, 0);
    }

    #[test]
    fn test_telemetry_apply() {
        let mut telemetry = DeviceTelemetry::default();
        let now = Utc::now();

        telemetry.apply(&TelemetryUpdate::ResultReceived { at: now });
        telemetry.apply(&TelemetryUpdate::Failure { message: "db down".to_string(), at: now });

        assert_eq!(telemetry.results_received, 1);
        assert_eq!(telemetry.last_result, Some(now));
        assert_eq!(telemetry.error_count, 1);
        assert_eq!(telemetry.last_error.as_deref(), Some("db down"));
    }

    #[test]
    fn test_transport_settings_tagged() {
        let json = r#"{"type": "serial", "path": "/dev/ttyUSB0"}"#;
        let settings: TransportSettings = serde_json::from_str(json).unwrap();
        assert_eq!(
            settings,
            TransportSettings::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: 1,
            }
        );
    }
}
