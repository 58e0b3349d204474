//! 外部协作方接口
//!
//! 设备目录、患者目录与结果存储由宿主系统提供，本模块只定义所需的读写操作。

use crate::error::Result;
use crate::models::{Device, Patient, ResultRecord, TelemetryUpdate};
use async_trait::async_trait;
use uuid::Uuid;

/// 设备目录
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// 读取所有启用状态设备的ID
    async fn list_active_ids(&self) -> Result<Vec<String>>;

    /// 按ID读取设备
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// 只更新遥测字段
    async fn update_telemetry(&self, device_id: &str, update: TelemetryUpdate) -> Result<()>;
}

/// 患者目录
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// 按外部标识精确查找患者
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Patient>>;
}

/// 检验结果存储
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 新建一条结果记录，返回记录ID
    async fn create_result(&self, record: &ResultRecord) -> Result<Uuid>;
}
