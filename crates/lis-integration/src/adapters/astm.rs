//! ASTM适配器：E1381低层协议（TCP或串口）承载E1394记录

use super::transport::{self, BoxedStream, SessionHandler};
use super::{is_push_only, transport_mismatch, AdapterFactory, AdapterLink, ProtocolAdapter};
use crate::astm::{self as grammar, E1381Codec, LinkEvent, ACK, NAK};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lis_core::utils::preview;
use lis_core::{Device, ParsedMessage, Protocol, Result, TransportSettings};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::debug;

/// E1381会话：ENQ/帧应答，EOT时提交整条消息
pub struct E1381Session;

#[async_trait]
impl SessionHandler for E1381Session {
    async fn run(&self, stream: BoxedStream, link: &AdapterLink) -> Result<()> {
        let mut framed = Framed::new(stream, E1381Codec::default());

        while let Some(event) = framed.next().await {
            match event? {
                LinkEvent::Enquiry => {
                    debug!("Device {}: ENQ received", link.device_id());
                    framed.send(ACK).await?;
                }
                LinkEvent::Frame { accepted } => {
                    framed.send(if accepted { ACK } else { NAK }).await?;
                }
                LinkEvent::Message(text) => {
                    debug!(
                        "Device {}: ASTM message received: {}",
                        link.device_id(),
                        preview(&text, 80)
                    );
                    link.sink.submit_detached(text).await?;
                }
            }
        }
        Ok(())
    }
}

/// 将ASTM文本解析为结构化结果
pub(crate) fn parse_astm(payload: &[u8]) -> ParsedMessage {
    grammar::parse_message(&String::from_utf8_lossy(payload))
}

pub struct AstmAdapter {
    transport: TransportSettings,
}

#[async_trait]
impl ProtocolAdapter for AstmAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Astm
    }

    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage> {
        Ok(parse_astm(payload))
    }

    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>> {
        transport::open_stream(&self.transport, Arc::new(E1381Session), link).await
    }
}

pub struct AstmFactory;

impl AdapterFactory for AstmFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Astm
    }

    fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>> {
        let supported = is_push_only(&device.transport)
            || matches!(
                device.transport,
                TransportSettings::TcpClient { .. }
                    | TransportSettings::TcpServer { .. }
                    | TransportSettings::Serial { .. }
            );
        if !supported {
            return Err(transport_mismatch(device));
        }

        Ok(Arc::new(AstmAdapter {
            transport: device.transport.clone(),
        }))
    }
}
