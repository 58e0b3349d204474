//! HL7适配器：MLLP承载的ORU^R01消息，每条消息回复ACK

use super::transport::{self, BoxedStream, SessionHandler};
use super::{is_push_only, transport_mismatch, AdapterFactory, AdapterLink, ProtocolAdapter};
use crate::hl7::{Hl7Message, MllpCodec};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lis_core::utils::preview;
use lis_core::{Device, ParsedMessage, Protocol, Result, TransportSettings};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// MLLP会话：等待处理结果后回复AA或AE
pub struct MllpSession;

#[async_trait]
impl SessionHandler for MllpSession {
    async fn run(&self, stream: BoxedStream, link: &AdapterLink) -> Result<()> {
        let mut framed = Framed::new(stream, MllpCodec::default());

        while let Some(text) = framed.next().await {
            let text = text?;
            debug!("Device {}: HL7 message received: {}", link.device_id(), preview(&text, 80));

            let outcome = link.sink.submit(text.clone()).await;

            match Hl7Message::parse(&text) {
                Ok(message) => {
                    let ack = match &outcome {
                        Ok(_) => message.generate_ack(true, None),
                        Err(e) => message.generate_ack(false, Some(&e.to_string())),
                    };
                    framed.send(ack).await?;
                }
                Err(e) => warn!("Device {}: cannot acknowledge HL7 message: {}", link.device_id(), e),
            }
        }
        Ok(())
    }
}

pub struct Hl7Adapter {
    transport: TransportSettings,
}

#[async_trait]
impl ProtocolAdapter for Hl7Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::Hl7
    }

    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage> {
        let message = Hl7Message::parse(&String::from_utf8_lossy(payload))?;
        Ok(message.extract_results()?)
    }

    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>> {
        transport::open_stream(&self.transport, Arc::new(MllpSession), link).await
    }
}

pub struct Hl7Factory;

impl AdapterFactory for Hl7Factory {
    fn protocol(&self) -> Protocol {
        Protocol::Hl7
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

        Ok(Arc::new(Hl7Adapter {
            transport: device.transport.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::LisError;

    #[test]
    fn test_parse_oru_payload() {
        let adapter = Hl7Adapter { transport: TransportSettings::None };
        let payload = b"MSH|^~\\&|AU480|LAB|LIS|H|20240101||ORU^R01|42|P|2.5\rPID|1||EXT123\rOBX|1|NM|GLU||98|mg/dL||N\r";

        let parsed = adapter.parse(payload).unwrap();
        assert_eq!(parsed.patient_external_id, "EXT123");
        assert_eq!(parsed.results[0].equipment_code, "GLU");
    }

    #[test]
    fn test_parse_rejects_non_hl7_payload() {
        let adapter = Hl7Adapter { transport: TransportSettings::None };
        assert!(matches!(adapter.parse(b"P|1|EXT123"), Err(LisError::MessageFormat(_))));
    }
}
