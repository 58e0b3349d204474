//! 串口适配器：RS-232上的ASTM E1381会话

use super::astm::{parse_astm, E1381Session};
use super::transport;
use super::{is_push_only, transport_mismatch, AdapterFactory, AdapterLink, ProtocolAdapter};
use async_trait::async_trait;
use lis_core::{Device, ParsedMessage, Protocol, Result, TransportSettings};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct SerialAdapter {
    transport: TransportSettings,
}

#[async_trait]
impl ProtocolAdapter for SerialAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage> {
        Ok(parse_astm(payload))
    }

    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>> {
        transport::open_stream(&self.transport, Arc::new(E1381Session), link).await
    }
}

pub struct SerialFactory;

impl AdapterFactory for SerialFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>> {
        if !is_push_only(&device.transport)
            && !matches!(device.transport, TransportSettings::Serial { .. })
        {
            return Err(transport_mismatch(device));
        }

        Ok(Arc::new(SerialAdapter {
            transport: device.transport.clone(),
        }))
    }
}
