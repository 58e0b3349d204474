//! 协议适配器
//!
//! 每种协议一个适配器：负责建立并维持传输，把收到的原始消息交给设备的处理队列，
//! 并提供该协议的消息解析。适配器通过 `AdapterRegistry` 按协议创建。

pub mod astm;
pub mod file;
pub mod hl7;
pub mod serial;
pub mod tcp;
pub mod transport;

use crate::gateway::IngestOutcome;
use async_trait::async_trait;
use lis_core::{
    ConnectionStatus, Device, LisError, ParsedMessage, Protocol, RawMessage, Result,
    TransportSettings,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use astm::{AstmAdapter, AstmFactory};
pub use file::{FileAdapter, FileFactory};
pub use hl7::{Hl7Adapter, Hl7Factory};
pub use serial::{SerialAdapter, SerialFactory};
pub use tcp::{TcpAdapter, TcpFactory};
pub use transport::ReconnectPolicy;

/// 设备处理队列中的一条消息
#[derive(Debug)]
pub struct Envelope {
    pub message: RawMessage,
    pub reply: Option<oneshot::Sender<Result<IngestOutcome>>>,
}

/// 向设备处理队列提交原始消息
#[derive(Debug, Clone)]
pub struct MessageSink {
    device_id: String,
    sender: mpsc::Sender<Envelope>,
}

impl MessageSink {
    pub fn new(device_id: impl Into<String>, sender: mpsc::Sender<Envelope>) -> Self {
        Self {
            device_id: device_id.into(),
            sender,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn closed(&self) -> LisError {
        LisError::ConnectionClosed(self.device_id.clone())
    }

    /// 提交并等待处理结果
    pub async fn submit(&self, payload: impl Into<Vec<u8>>) -> Result<IngestOutcome> {
        let (reply, outcome) = oneshot::channel();
        let envelope = Envelope {
            message: RawMessage::new(self.device_id.clone(), payload),
            reply: Some(reply),
        };

        self.sender.send(envelope).await.map_err(|_| self.closed())?;
        outcome.await.map_err(|_| self.closed())?
    }

    /// 提交后立即返回，处理结果只记录日志
    pub async fn submit_detached(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let envelope = Envelope {
            message: RawMessage::new(self.device_id.clone(), payload),
            reply: None,
        };
        self.sender.send(envelope).await.map_err(|_| self.closed())
    }
}

/// 适配器运行所需的上下文
#[derive(Debug, Clone)]
pub struct AdapterLink {
    pub device: Device,
    pub sink: MessageSink,
    pub status: Arc<watch::Sender<ConnectionStatus>>,
    pub cancel: CancellationToken,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl AdapterLink {
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!("Device {}: connection {:?} -> {:?}", self.device.id, previous, status);
        }
    }
}

/// 协议适配器接口
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// 将一条原始消息解析为结构化结果
    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage>;

    /// 建立传输并启动后台任务；只接受推送消息的设备返回 `None`
    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>>;
}

/// 适配器工厂
pub trait AdapterFactory: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>>;
}

/// 传输配置与协议不匹配
pub(crate) fn transport_mismatch(device: &Device) -> LisError {
    LisError::Config(format!(
        "设备 {} 的传输配置 {:?} 不适用于 {} 协议",
        device.id, device.transport, device.protocol
    ))
}

/// 适配器注册表
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<Protocol, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置协议
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AstmFactory));
        registry.register(Arc::new(Hl7Factory));
        registry.register(Arc::new(SerialFactory));
        registry.register(Arc::new(TcpFactory));
        registry.register(Arc::new(FileFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.protocol(), factory);
    }

    pub fn is_registered(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    pub fn registered_protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.factories.keys().copied().collect();
        protocols.sort_by_key(|p| p.as_str());
        protocols
    }

    /// 按设备协议创建适配器
    pub fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>> {
        let factory = self
            .factories
            .get(&device.protocol)
            .ok_or_else(|| LisError::UnsupportedProtocol(device.protocol.to_string()))?;
        factory.create(device)
    }
}

/// 设备是否只接受推送
pub(crate) fn is_push_only(settings: &TransportSettings) -> bool {
    matches!(settings, TransportSettings::None)
}
