//! # LIS集成模块
//!
//! 检验仪器接入与结果处理，包括：
//! - ASTM与HL7消息解析及其传输帧编解码
//! - 按协议创建的适配器（ASTM、HL7、串口、TCP、文件目录）
//! - 参数映射、待匹配队列与结果持久化网关
//! - 新结果通知（进程内广播、Webhook）
//! - 设备连接生命周期管理

pub mod adapters;
pub mod astm;
pub mod events;
pub mod gateway;
pub mod hl7;
pub mod manager;
pub mod mapper;
pub mod pending;

pub use adapters::{AdapterFactory, AdapterLink, AdapterRegistry, ProtocolAdapter, ReconnectPolicy};
pub use events::{BroadcastEventSink, EventSink, NewResultEvent, NullEventSink, WebhookEventSink};
pub use gateway::{IngestOutcome, ReconcileSummary, ResultGateway, TimeoutSettings};
pub use hl7::{Hl7Error, Hl7Message};
pub use manager::{ConnectionManager, ManagerSettings, StartSummary};
pub use pending::{PendingMatch, PendingMatchQueue};
