//! Transport trait and types

use async_trait::async_trait;
use udsim_core::TransportKind;

use super::TransportError;

/// Addressing of the simulated link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    /// Tester -> ECU (CAN id or DoIP source address)
    pub tx_id: u32,
    /// ECU -> tester (CAN id or DoIP target address)
    pub rx_id: u32,
}

/// How a payload is carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Framing {
    pub frames: u32,
    /// Protocol bytes added on top of the UDS payload
    pub overhead_bytes: u32,
}

/// Simulated transport binding
///
/// The simulators use an echo model: `send` returns the payload unchanged
/// after the binding's simulated latency. The latency is the only suspension
/// point of a diagnostic exchange. Implementations must be callable
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Carry `payload` across the simulated link
    async fn send(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn kind(&self) -> TransportKind;

    fn address_info(&self) -> AddressInfo;

    /// Framing the binding would apply to a payload of `len` bytes
    fn framing(&self, len: usize) -> Framing;
}
