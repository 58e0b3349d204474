//! 设备连接管理
//!
//! 维护设备ID到运行时连接的映射。每个连接包含：
//! - 协议适配器启动的传输任务（无推送传输时为空）
//! - 一个按到达顺序逐条处理消息的工作任务
//! - 连接状态与取消令牌
//!
//! 不同设备并行处理；同一设备的消息严格串行。

use crate::adapters::{
    AdapterLink, AdapterRegistry, Envelope, MessageSink, ProtocolAdapter, ReconnectPolicy,
};
use crate::gateway::{IngestOutcome, ResultGateway};
use futures::future::join_all;
use lis_core::utils::{preview, with_timeout};
use lis_core::{
    ConnectionInfo, ConnectionStatus, Device, DeviceDirectory, LisError, Protocol, RawMessage,
    Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连接管理配置
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// 每个设备处理队列的容量
    pub queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 批量启动结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartSummary {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// 运行中的设备连接
struct DeviceConnection {
    device: Device,
    protocol: Protocol,
    status: watch::Receiver<ConnectionStatus>,
    sink: MessageSink,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    transport: Option<JoinHandle<()>>,
}

impl DeviceConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            device_id: self.device.id.clone(),
            name: self.device.name.clone(),
            protocol: self.protocol,
            status: *self.status.borrow(),
        }
    }

    /// 停止接收新消息并释放传输；正在处理的消息会完成
    async fn shutdown(self) {
        self.cancel.cancel();

        if let Some(transport) = self.transport {
            if let Err(e) = transport.await {
                error!("Device {}: transport task failed: {}", self.device.id, e);
            }
        }
        if let Err(e) = self.worker.await {
            error!("Device {}: worker task failed: {}", self.device.id, e);
        }
    }
}

/// 设备连接管理器
pub struct ConnectionManager {
    devices: Arc<dyn DeviceDirectory>,
    gateway: Arc<ResultGateway>,
    registry: AdapterRegistry,
    settings: ManagerSettings,
    connections: RwLock<HashMap<String, DeviceConnection>>,
}

impl ConnectionManager {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        gateway: Arc<ResultGateway>,
        registry: AdapterRegistry,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            devices,
            gateway,
            registry,
            settings,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<ResultGateway> {
        &self.gateway
    }

    /// 启动所有启用状态的设备，单个设备失败不影响其他设备
    pub async fn start_all(&self) -> Result<StartSummary> {
        let ids = with_timeout(
            "list active devices",
            self.gateway.timeouts().persistence,
            self.devices.list_active_ids(),
        )
        .await?;
        info!("Starting {} active devices", ids.len());

        let attempts = ids.iter().map(|id| async move { (id.clone(), self.start_device(id).await) });
        let mut summary = StartSummary::default();

        for (id, result) in join_all(attempts).await {
            match result {
                Ok(()) => summary.started.push(id),
                Err(e) => {
                    error!("Failed to start device {}: {}", id, e);
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            "Device startup finished: {} started, {} failed",
            summary.started.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// 启动单个设备，已有连接时替换旧连接
    ///
    /// 设备读取或适配器创建失败时旧连接保持不变；旧连接在打开新传输前关闭。
    pub async fn start_device(&self, device_id: &str) -> Result<()> {
        let device = with_timeout(
            "load device",
            self.gateway.timeouts().persistence,
            self.devices.get_device(device_id),
        )
        .await?
        .ok_or_else(|| LisError::NotFound(format!("设备 {}", device_id)))?;

        let adapter = self.registry.create(&device)?;

        let previous = self.connections.write().await.remove(device_id);
        if let Some(previous) = previous {
            info!("Device {}: replacing existing connection", device_id);
            previous.shutdown().await;
        }

        let (sender, receiver) = mpsc::channel(self.settings.queue_capacity.max(1));
        let (status_sender, status) = watch::channel(ConnectionStatus::Connected);
        let cancel = CancellationToken::new();
        let sink = MessageSink::new(device.id.clone(), sender);

        let link = AdapterLink {
            device: device.clone(),
            sink: sink.clone(),
            status: Arc::new(status_sender),
            cancel: cancel.clone(),
            reconnect: self.settings.reconnect.clone(),
            connect_timeout: self.gateway.timeouts().connect,
        };
        let transport = adapter.open(link).await?;

        let worker = tokio::spawn(run_worker(
            device.clone(),
            adapter.clone(),
            self.gateway.clone(),
            receiver,
            cancel.clone(),
        ));

        let connection = DeviceConnection {
            protocol: adapter.protocol(),
            device,
            status,
            sink,
            cancel,
            worker,
            transport,
        };

        let displaced = self
            .connections
            .write()
            .await
            .insert(device_id.to_string(), connection);
        if let Some(displaced) = displaced {
            displaced.shutdown().await;
        }

        info!("Device {} started", device_id);
        Ok(())
    }

    /// 停止设备；没有运行中的连接时什么也不做
    ///
    /// 返回是否确实停止了一个连接。
    pub async fn stop_device(&self, device_id: &str) -> bool {
        let removed = self.connections.write().await.remove(device_id);
        match removed {
            Some(connection) => {
                connection.shutdown().await;
                info!("Device {} stopped", device_id);
                true
            }
            None => {
                debug!("Device {} has no live connection", device_id);
                false
            }
        }
    }

    /// 停止全部连接
    pub async fn stop_all(&self) {
        let connections: Vec<DeviceConnection> = {
            let mut table = self.connections.write().await;
            table.drain().map(|(_, connection)| connection).collect()
        };

        let count = connections.len();
        join_all(connections.into_iter().map(DeviceConnection::shutdown)).await;
        info!("Stopped {} device connections", count);
    }

    /// 当前连接快照，按设备ID排序
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(DeviceConnection::info)
            .collect();
        connections.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        connections
    }

    /// 提交一条原始消息并等待处理结果
    pub async fn feed_raw_message(
        &self,
        device_id: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<IngestOutcome> {
        self.sink(device_id).await?.submit(payload).await
    }

    /// 提交一条原始消息，不等待处理结果
    pub async fn feed_raw_message_detached(
        &self,
        device_id: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.sink(device_id).await?.submit_detached(payload).await
    }

    async fn sink(&self, device_id: &str) -> Result<MessageSink> {
        self.connections
            .read()
            .await
            .get(device_id)
            .map(|connection| connection.sink.clone())
            .ok_or_else(|| LisError::NotFound(format!("设备 {} 没有运行中的连接", device_id)))
    }
}

async fn run_worker(
    device: Device,
    adapter: Arc<dyn ProtocolAdapter>,
    gateway: Arc<ResultGateway>,
    mut receiver: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        // 在分支体内处理，停止设备时不会中断正在处理的消息
        let outcome = handle_message(&device, adapter.as_ref(), &gateway, &envelope.message).await;

        match envelope.reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    warn!("Device {}: message dropped: {}", device.id, e);
                }
            }
        }
    }

    debug!("Device {}: worker stopped", device.id);
}

async fn handle_message(
    device: &Device,
    adapter: &dyn ProtocolAdapter,
    gateway: &ResultGateway,
    message: &RawMessage,
) -> Result<IngestOutcome> {
    debug!(
        "Device {}: processing message received at {}: {}",
        device.id,
        message.received_at,
        preview(&message.text(), 80)
    );

    let parsed = match adapter.parse(&message.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            gateway.record_failure(&device.id, &e).await;
            return Err(e);
        }
    };

    gateway.process(device, parsed).await
}
