//! Simulated CAN / ISO-TP transport

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use udsim_core::TransportKind;

use super::{AddressInfo, Framing, Transport, TransportError};
use crate::config::{parse_can_id, CanConfig};

/// Largest payload a 12-bit first frame length can announce
pub const ISO_TP_CLASSIC_MAX: usize = 4095;

/// Payload bytes in a single frame
const SINGLE_FRAME_CAPACITY: usize = 7;
/// Payload bytes in a first frame
const FIRST_FRAME_CAPACITY: usize = 6;
/// Payload bytes in an escape first frame (32-bit length)
const ESCAPE_FIRST_FRAME_CAPACITY: usize = 2;
/// Payload bytes in a consecutive frame
const CONSECUTIVE_FRAME_CAPACITY: usize = 7;

/// Number of ISO-TP frames needed for a payload of `len` bytes
///
/// Single frame up to 7 bytes, otherwise a first frame carrying 6 bytes
/// followed by consecutive frames of 7. Payloads above 4095 bytes use the
/// escape first frame, which carries only 2.
pub fn iso_tp_frame_count(len: usize) -> u32 {
    if len <= SINGLE_FRAME_CAPACITY {
        return 1;
    }
    let first = if len > ISO_TP_CLASSIC_MAX {
        ESCAPE_FIRST_FRAME_CAPACITY
    } else {
        FIRST_FRAME_CAPACITY
    };
    let remaining = len - first;
    1 + remaining.div_ceil(CONSECUTIVE_FRAME_CAPACITY) as u32
}

/// CAN transport simulator
///
/// Applies a fixed per-call latency plus `st_min` for every consecutive frame.
pub struct CanTransport {
    latency: Duration,
    st_min: Duration,
    address: AddressInfo,
}

impl CanTransport {
    pub fn new(config: &CanConfig) -> Result<Self, TransportError> {
        let tx_id = parse_can_id(&config.tx_id)
            .map_err(|e| TransportError::InvalidConfig(format!("tx_id: {}", e)))?;
        let rx_id = parse_can_id(&config.rx_id)
            .map_err(|e| TransportError::InvalidConfig(format!("rx_id: {}", e)))?;

        Ok(Self {
            latency: Duration::from_millis(config.latency_ms),
            st_min: Duration::from_millis(config.st_min_ms),
            address: AddressInfo { tx_id, rx_id },
        })
    }

    /// Simulated delay for a payload of `len` bytes
    pub fn delay_for(&self, len: usize) -> Duration {
        let consecutive = iso_tp_frame_count(len).saturating_sub(1);
        self.latency + self.st_min * consecutive
    }
}

#[async_trait]
impl Transport for CanTransport {
    async fn send(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::SendFailed("empty payload".to_string()));
        }

        let delay = self.delay_for(payload.len());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        debug!(
            tx_id = format!("0x{:X}", self.address.tx_id),
            len = payload.len(),
            frames = iso_tp_frame_count(payload.len()),
            "CAN transport: sent message"
        );
        Ok(payload.to_vec())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Can
    }

    fn address_info(&self) -> AddressInfo {
        self.address
    }

    fn framing(&self, len: usize) -> Framing {
        Framing {
            frames: iso_tp_frame_count(len),
            overhead_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(latency_ms: u64, st_min_ms: u64) -> CanConfig {
        CanConfig {
            latency_ms,
            st_min_ms,
            ..CanConfig::default()
        }
    }

    #[test]
    fn test_iso_tp_frame_count() {
        assert_eq!(iso_tp_frame_count(1), 1);
        assert_eq!(iso_tp_frame_count(7), 1);
        assert_eq!(iso_tp_frame_count(8), 2);
        assert_eq!(iso_tp_frame_count(13), 2);
        assert_eq!(iso_tp_frame_count(14), 3);
        assert_eq!(iso_tp_frame_count(20), 3);
        assert_eq!(iso_tp_frame_count(4095), 586);
        // Escape first frame carries 2 bytes
        assert_eq!(iso_tp_frame_count(4100), 587);
    }

    #[test]
    fn test_delay_includes_separation_time() {
        let transport = CanTransport::new(&config(50, 2)).unwrap();
        assert_eq!(transport.delay_for(3), Duration::from_millis(50));
        assert_eq!(transport.delay_for(20), Duration::from_millis(54));
    }

    #[tokio::test]
    async fn test_send_echoes_payload() {
        let transport = CanTransport::new(&config(1, 0)).unwrap();
        let payload = [0x22, 0xF1, 0x90];
        assert_eq!(transport.send(&payload).await.unwrap(), payload.to_vec());
        assert_eq!(transport.kind(), TransportKind::Can);
        assert_eq!(transport.address_info().tx_id, 0x7E0);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_payload() {
        let transport = CanTransport::new(&config(0, 0)).unwrap();
        assert!(matches!(
            transport.send(&[]).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_delivers_payload_beyond_classic_length() {
        let transport = CanTransport::new(&config(0, 0)).unwrap();
        // 0x36 with a block counter and 4095 data bytes
        let mut transfer = vec![0x36, 0x01];
        transfer.extend(std::iter::repeat(0x00).take(ISO_TP_CLASSIC_MAX));
        assert_eq!(transfer.len(), 4097);

        let delivered = transport.send(&transfer).await.unwrap();
        assert_eq!(delivered, transfer);
        assert_eq!(transport.framing(transfer.len()).frames, 586);
    }

    #[test]
    fn test_invalid_can_id() {
        let bad = CanConfig {
            tx_id: "zz".to_string(),
            ..CanConfig::default()
        };
        assert!(matches!(
            CanTransport::new(&bad),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
