//! 结果持久化网关
//!
//! 负责一条已解析消息的后续处理：查找患者、映射数值、保存结果、
//! 更新设备遥测并发出通知；患者不存在时转入待匹配队列。

use crate::events::{EventSink, NewResultEvent};
use crate::mapper;
use crate::pending::{PendingMatch, PendingMatchQueue};
use chrono::Utc;
use lis_core::utils::with_timeout;
use lis_core::{
    Device, DeviceDirectory, LisError, MappedResultValue, ParsedMessage, ParsedResult, Patient,
    PatientDirectory, Result, ResultRecord, ResultStore, TelemetryUpdate, ValidationState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 外部调用超时配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutSettings {
    pub connect: Duration,
    pub patient_lookup: Duration,
    pub persistence: Duration,
    pub telemetry: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            patient_lookup: Duration::from_secs(3),
            persistence: Duration::from_secs(5),
            telemetry: Duration::from_secs(3),
        }
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// 已保存为结果记录
    Stored {
        record_id: Uuid,
        values: Vec<MappedResultValue>,
    },
    /// 患者未找到，已转入待匹配队列
    Deferred { patient_external_id: String },
    /// 消息中没有结果记录
    Empty,
}

/// 待匹配重试统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub stored: usize,
    pub still_pending: usize,
    /// 暂时性失败，条目保留等待下次重试
    pub failed: usize,
    /// 无法处理的条目（数值解析等），已记录到设备遥测并移出队列
    pub discarded: usize,
}

/// 尽力而为地执行遥测写入：失败只记录日志，不影响调用方
pub async fn best_effort<F>(device_id: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    if let Err(e) = fut.await {
        let error = LisError::Telemetry(e.to_string());
        warn!("Device {}: {}", device_id, error);
    }
}

/// 结果持久化网关
pub struct ResultGateway {
    devices: Arc<dyn DeviceDirectory>,
    patients: Arc<dyn PatientDirectory>,
    results: Arc<dyn ResultStore>,
    events: Arc<dyn EventSink>,
    pending: PendingMatchQueue,
    timeouts: TimeoutSettings,
}

impl ResultGateway {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        patients: Arc<dyn PatientDirectory>,
        results: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            devices,
            patients,
            results,
            events,
            pending: PendingMatchQueue::new(),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &TimeoutSettings {
        &self.timeouts
    }

    pub fn pending(&self) -> &PendingMatchQueue {
        &self.pending
    }

    /// 处理一条已解析的消息
    ///
    /// 处理失败（数值解析、持久化、超时）会记录到设备遥测，然后原样返回给调用方。
    pub async fn process(&self, device: &Device, message: ParsedMessage) -> Result<IngestOutcome> {
        if message.is_empty() {
            debug!("Device {}: message has no result records", device.id);
            return Ok(IngestOutcome::Empty);
        }

        match self.store_or_defer(device, message).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&device.id, &e).await;
                Err(e)
            }
        }
    }

    /// 将处理失败写入设备遥测（尽力而为）
    pub async fn record_failure(&self, device_id: &str, failure: &LisError) {
        error!("Device {}: failed to process message: {}", device_id, failure);
        if !failure.is_processing_failure() {
            return;
        }

        let update = TelemetryUpdate::Failure {
            message: failure.to_string(),
            at: Utc::now(),
        };
        best_effort(
            device_id,
            with_timeout(
                "telemetry update",
                self.timeouts.telemetry,
                self.devices.update_telemetry(device_id, update),
            ),
        )
        .await;
    }

    async fn store_or_defer(&self, device: &Device, message: ParsedMessage) -> Result<IngestOutcome> {
        let patient = if message.patient_external_id.is_empty() {
            None
        } else {
            self.find_patient(&message.patient_external_id).await?
        };

        let Some(patient) = patient else {
            return Ok(self.defer(device, message).await);
        };

        let (record_id, values) = self.persist(device, &patient, &message.results).await?;
        Ok(IngestOutcome::Stored { record_id, values })
    }

    async fn find_patient(&self, external_id: &str) -> Result<Option<Patient>> {
        with_timeout(
            "patient lookup",
            self.timeouts.patient_lookup,
            self.patients.find_by_external_id(external_id),
        )
        .await
    }

    async fn defer(&self, device: &Device, message: ParsedMessage) -> IngestOutcome {
        let patient_external_id = message.patient_external_id;
        let replaced = self
            .pending
            .upsert(PendingMatch::new(
                device.id.clone(),
                patient_external_id.clone(),
                message.results,
            ))
            .await;

        warn!(
            "Device {}: patient '{}' not found, results queued for later matching{}",
            device.id,
            patient_external_id,
            if replaced { " (replaced previous entry)" } else { "" }
        );
        IngestOutcome::Deferred { patient_external_id }
    }

    /// 映射、保存、更新遥测、发出通知
    async fn persist(
        &self,
        device: &Device,
        patient: &Patient,
        results: &[ParsedResult],
    ) -> Result<(Uuid, Vec<MappedResultValue>)> {
        let values = mapper::map_results(device, results)?;
        let now = Utc::now();

        let record = ResultRecord {
            id: Uuid::new_v4(),
            patient_id: patient.id,
            device_id: device.id.clone(),
            values,
            validation_state: ValidationState::PendingValidation,
            received_at: now,
        };

        let record_id = with_timeout(
            "persist result",
            self.timeouts.persistence,
            self.results.create_result(&record),
        )
        .await?;

        best_effort(
            &device.id,
            with_timeout(
                "telemetry update",
                self.timeouts.telemetry,
                self.devices
                    .update_telemetry(&device.id, TelemetryUpdate::ResultReceived { at: now }),
            ),
        )
        .await;

        self.events.publish(NewResultEvent::new(
            device.id.clone(),
            device.name.clone(),
            patient.name.clone(),
            record_id,
        ));

        info!(
            "Device {}: stored result {} for patient {} ({} values)",
            device.id,
            record_id,
            patient.external_id,
            record.values.len()
        );
        Ok((record_id, record.values))
    }

    /// 重试待匹配队列中的全部条目
    ///
    /// 患者已建档的条目会被保存并移出队列；处理期间被新消息覆盖的条目保留。
    /// 暂时性失败的条目留待下次重试，其余失败的条目记录一次后丢弃。
    pub async fn reconcile_pending(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for entry in self.pending.snapshot().await {
            if entry.patient_external_id.is_empty() {
                summary.still_pending += 1;
                continue;
            }

            let patient = match self.find_patient(&entry.patient_external_id).await {
                Ok(Some(patient)) => patient,
                Ok(None) => {
                    summary.still_pending += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Pending match {}/{}: patient lookup failed: {}",
                        entry.device_id, entry.patient_external_id, e
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            let device = match with_timeout(
                "load device",
                self.timeouts.persistence,
                self.devices.get_device(&entry.device_id),
            )
            .await
            {
                Ok(Some(device)) => device,
                Ok(None) => {
                    warn!("Pending match for unknown device {}", entry.device_id);
                    summary.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Pending match {}: failed to load device: {}", entry.device_id, e);
                    summary.failed += 1;
                    continue;
                }
            };

            match self.persist(&device, &patient, &entry.results).await {
                Ok((record_id, _)) => {
                    self.pending.remove_if_unchanged(&entry).await;
                    info!(
                        "Matched pending results for patient {} on device {} (result {})",
                        entry.patient_external_id, entry.device_id, record_id
                    );
                    summary.stored += 1;
                }
                Err(e) if e.is_transient() => {
                    self.record_failure(&device.id, &e).await;
                    summary.failed += 1;
                }
                Err(e) => {
                    self.record_failure(&device.id, &e).await;
                    self.pending.remove_if_unchanged(&entry).await;
                    warn!(
                        "Discarded pending results for patient {} on device {}: {}",
                        entry.patient_external_id, entry.device_id, e
                    );
                    summary.discarded += 1;
                }
            }
        }

        if summary != ReconcileSummary::default() {
            info!(
                "Pending reconciliation: stored={}, still_pending={}, failed={}, discarded={}",
                summary.stored, summary.still_pending, summary.failed, summary.discarded
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use async_trait::async_trait;
    use lis_core::{DeviceState, DeviceTelemetry, Protocol, TransportSettings};
    use std::sync::Mutex;

    /// 遥测写入总是失败的设备目录
    struct FailingTelemetry {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl DeviceDirectory for FailingTelemetry {
        async fn list_active_ids(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn get_device(&self, _device_id: &str) -> Result<Option<Device>> {
            Ok(None)
        }

        async fn update_telemetry(&self, _device_id: &str, _update: TelemetryUpdate) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            Err(LisError::Persistence("devices table locked".to_string()))
        }
    }

    struct OnePatient;

    #[async_trait]
    impl PatientDirectory for OnePatient {
        async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Patient>> {
            Ok((external_id == "EXT123").then(|| Patient {
                id: Uuid::new_v4(),
                external_id: external_id.to_string(),
                name: "Ana Perez".to_string(),
            }))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ResultStore for BrokenStore {
        async fn create_result(&self, _record: &ResultRecord) -> Result<Uuid> {
            Err(LisError::Persistence("disk full".to_string()))
        }
    }

    struct AcceptingStore;

    #[async_trait]
    impl ResultStore for AcceptingStore {
        async fn create_result(&self, record: &ResultRecord) -> Result<Uuid> {
            Ok(record.id)
        }
    }

    fn device() -> Device {
        Device {
            id: "bs200".to_string(),
            name: "Mindray BS-200".to_string(),
            protocol: Protocol::Astm,
            state: DeviceState::Active,
            transport: TransportSettings::None,
            parameter_mappings: vec![],
            telemetry: DeviceTelemetry::default(),
        }
    }

    fn message(patient: &str) -> ParsedMessage {
        ParsedMessage {
            patient_external_id: patient.to_string(),
            results: vec![ParsedResult {
                equipment_code: "GLU".to_string(),
                raw_value: "98".to_string(),
                raw_unit: "mg/dL".to_string(),
                raw_flag_code: "N".to_string(),
            }],
        }
    }

    fn gateway(devices: Arc<FailingTelemetry>, store: Arc<dyn ResultStore>) -> ResultGateway {
        ResultGateway::new(
            devices,
            Arc::new(OnePatient),
            store,
            Arc::new(NullEventSink),
            TimeoutSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_telemetry_failure_does_not_mask_persistence_error() {
        let devices = Arc::new(FailingTelemetry { calls: Mutex::new(0) });
        let gateway = gateway(devices.clone(), Arc::new(BrokenStore));

        let result = gateway.process(&device(), message("EXT123")).await;
        assert!(matches!(result, Err(LisError::Persistence(m)) if m == "disk full"));
        assert_eq!(*devices.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_failure_after_store_is_still_success() {
        let devices = Arc::new(FailingTelemetry { calls: Mutex::new(0) });
        let gateway = gateway(devices.clone(), Arc::new(AcceptingStore));

        let outcome = gateway.process(&device(), message("EXT123")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
        assert_eq!(*devices.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_patient_identifier_is_deferred() {
        let devices = Arc::new(FailingTelemetry { calls: Mutex::new(0) });
        let gateway = gateway(devices.clone(), Arc::new(AcceptingStore));

        let outcome = gateway.process(&device(), message("")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred { patient_external_id: String::new() });
        assert_eq!(gateway.pending().len().await, 1);
        assert_eq!(*devices.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_message() {
        let devices = Arc::new(FailingTelemetry { calls: Mutex::new(0) });
        let gateway = gateway(devices, Arc::new(AcceptingStore));
        let outcome = gateway.process(&device(), ParsedMessage::default()).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Empty);
    }
}
