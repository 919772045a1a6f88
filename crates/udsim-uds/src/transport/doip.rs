//! Simulated DoIP (ISO 13400) transport

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use udsim_core::TransportKind;

use super::{AddressInfo, Framing, Transport, TransportError};
use crate::config::DoIpConfig;

/// DoIP generic header length
pub const GENERIC_HEADER_LEN: u32 = 8;

/// Source + target logical address in a diagnostic message
pub const DIAGNOSTIC_MESSAGE_HEADER_LEN: u32 = 4;

/// DoIP transport simulator
///
/// A whole UDS message travels in one diagnostic message, so only the fixed
/// per-call latency applies.
pub struct DoIpTransport {
    latency: Duration,
    address: AddressInfo,
}

impl DoIpTransport {
    pub fn new(config: &DoIpConfig) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            address: AddressInfo {
                tx_id: u32::from(config.source_address),
                rx_id: u32::from(config.target_address),
            },
        }
    }
}

#[async_trait]
impl Transport for DoIpTransport {
    async fn send(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::SendFailed("empty payload".to_string()));
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        debug!(
            source_address = format!("0x{:04X}", self.address.tx_id),
            target_address = format!("0x{:04X}", self.address.rx_id),
            len = payload.len(),
            "DoIP transport: sent diagnostic message"
        );
        Ok(payload.to_vec())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::DoIp
    }

    fn address_info(&self) -> AddressInfo {
        self.address
    }

    fn framing(&self, _len: usize) -> Framing {
        Framing {
            frames: 1,
            overhead_bytes: GENERIC_HEADER_LEN + DIAGNOSTIC_MESSAGE_HEADER_LEN,
        }
    }
}
