//! TCP适配器：不带低层帧的ASTM记录行，`L` 记录结束一条消息

use super::astm::parse_astm;
use super::transport::{self, BoxedStream, SessionHandler};
use super::{is_push_only, transport_mismatch, AdapterFactory, AdapterLink, ProtocolAdapter};
use async_trait::async_trait;
use futures::StreamExt;
use lis_core::{Device, LisError, ParsedMessage, Protocol, Result, TransportSettings};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::warn;

const MAX_LINE_LENGTH: usize = 16 * 1024;

/// 逐行读取ASTM记录
pub struct LineSession;

#[async_trait]
impl SessionHandler for LineSession {
    async fn run(&self, stream: BoxedStream, link: &AdapterLink) -> Result<()> {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut records: Vec<String> = Vec::new();

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| LisError::Transport(e.to_string()))?;
            let record_type = line.split('|').next().unwrap_or_default();
            let is_header = record_type == "H";
            let is_terminator = record_type == "L";

            if is_header && !records.is_empty() {
                warn!(
                    "Device {}: header received before terminator, submitting {} buffered records",
                    link.device_id(),
                    records.len()
                );
                link.sink.submit_detached(records.join("\n")).await?;
                records.clear();
            }

            records.push(line);
            if is_terminator {
                link.sink.submit_detached(records.join("\n")).await?;
                records.clear();
            }
        }

        // 对端断开时提交未结束的消息
        if !records.is_empty() {
            link.sink.submit_detached(records.join("\n")).await?;
        }
        Ok(())
    }
}

pub struct TcpAdapter {
    transport: TransportSettings,
}

#[async_trait]
impl ProtocolAdapter for TcpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage> {
        Ok(parse_astm(payload))
    }

    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>> {
        transport::open_stream(&self.transport, Arc::new(LineSession), link).await
    }
}

pub struct TcpFactory;

impl AdapterFactory for TcpFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>> {
        let supported = is_push_only(&device.transport)
            || matches!(
                device.transport,
                TransportSettings::TcpClient { .. } | TransportSettings::TcpServer { .. }
            );
        if !supported {
            return Err(transport_mismatch(device));
        }

        Ok(Arc::new(TcpAdapter {
            transport: device.transport.clone(),
        }))
    }
}
