//! 内存存储
//!
//! 用于开发环境与测试：设备、患者和结果都保存在进程内，可由种子文件初始化。

use async_trait::async_trait;
use lis_core::{
    Device, DeviceDirectory, LisError, Patient, PatientDirectory, Result, ResultRecord,
    ResultStore, TelemetryUpdate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 种子数据文件格式
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub patients: Vec<Patient>,
}

/// 内存中的设备目录、患者目录与结果存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, Device>>,
    patients: RwLock<HashMap<String, Patient>>,
    results: RwLock<Vec<ResultRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由种子数据创建
    pub fn from_seed(seed: SeedData) -> Self {
        let devices = seed
            .devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();
        let patients = seed
            .patients
            .into_iter()
            .map(|patient| (patient.external_id.clone(), patient))
            .collect();

        Self {
            devices: RwLock::new(devices),
            patients: RwLock::new(patients),
            results: RwLock::new(Vec::new()),
        }
    }

    /// 从JSON种子文件加载
    pub async fn load_seed_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let seed: SeedData = serde_json::from_str(&content)?;

        tracing::info!(
            "Loaded seed file {} ({} devices, {} patients)",
            path.as_ref().display(),
            seed.devices.len(),
            seed.patients.len()
        );
        Ok(Self::from_seed(seed))
    }

    pub async fn insert_device(&self, device: Device) {
        self.devices.write().await.insert(device.id.clone(), device);
    }

    pub async fn insert_patient(&self, patient: Patient) {
        self.patients
            .write()
            .await
            .insert(patient.external_id.clone(), patient);
    }

    /// 读取设备当前状态（含遥测）
    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// 已保存的全部结果
    pub async fn results(&self) -> Vec<ResultRecord> {
        self.results.read().await.clone()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn list_active_ids(&self) -> Result<Vec<String>> {
        let devices = self.devices.read().await;
        let mut ids: Vec<String> = devices
            .values()
            .filter(|device| device.is_active())
            .map(|device| device.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn update_telemetry(&self, device_id: &str, update: TelemetryUpdate) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| LisError::NotFound(format!("设备 {}", device_id)))?;
        device.telemetry.apply(&update);
        Ok(())
    }
}

#[async_trait]
impl PatientDirectory for MemoryStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Patient>> {
        Ok(self.patients.read().await.get(external_id).cloned())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_result(&self, record: &ResultRecord) -> Result<Uuid> {
        self.results.write().await.push(record.clone());
        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lis_core::{DeviceState, DeviceTelemetry, Protocol, TransportSettings};
    use std::io::Write;

    fn device(id: &str, state: DeviceState) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Analyzer {}", id),
            protocol: Protocol::Astm,
            state,
            transport: TransportSettings::None,
            parameter_mappings: Vec::new(),
            telemetry: DeviceTelemetry::default(),
        }
    }

    #[tokio::test]
    async fn test_list_active_ids_filters_inactive() {
        let store = MemoryStore::new();
        store.insert_device(device("b", DeviceState::Active)).await;
        store.insert_device(device("a", DeviceState::Active)).await;
        store.insert_device(device("c", DeviceState::Inactive)).await;

        assert_eq!(store.list_active_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_telemetry_unknown_device() {
        let store = MemoryStore::new();
        let result = store
            .update_telemetry("ghost", TelemetryUpdate::ResultReceived { at: Utc::now() })
            .await;
        assert!(matches!(result, Err(LisError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "devices": [{{"id": "bs200", "name": "BS-200", "protocol": "ASTM", "state": "active"}}],
                "patients": [{{"id": "6f1c7a52-8f0e-4d7b-a1c3-2b9e5d4f3a10", "external_id": "EXT123", "name": "Ana Perez"}}]
            }}"#
        )
        .unwrap();

        let store = MemoryStore::load_seed_file(file.path()).await.unwrap();
        assert!(store.device("bs200").await.is_some());
        let patient = store.find_by_external_id("EXT123").await.unwrap().unwrap();
        assert_eq!(patient.name, "Ana Perez");
    }
}
