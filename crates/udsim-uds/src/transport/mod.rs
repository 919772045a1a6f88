//! Simulated transports for UDS communication
//!
//! - CAN with ISO-TP segmentation (larger per-call delay)
//! - DoIP (Diagnostics over IP, ISO 13400; smaller per-call delay)
//!
//! # Example
//!
//! ```ignore
//! use udsim_uds::transport::create_transports;
//! use udsim_uds::config::TransportsConfig;
//!
//! let transports = create_transports(&TransportsConfig::default())?;
//! let echoed = transports.for_kind(TransportKind::Can).send(&[0x10, 0x03]).await?;
//! ```

mod adapter;
pub mod can;
pub mod doip;
pub mod error;

pub use adapter::{AddressInfo, Framing, Transport};
pub use can::{iso_tp_frame_count, CanTransport};
pub use doip::DoIpTransport;
pub use error::TransportError;

use std::sync::Arc;

use udsim_core::TransportKind;

use crate::config::TransportsConfig;

/// One transport per binding
#[derive(Clone)]
pub struct TransportSet {
    can: Arc<dyn Transport>,
    doip: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn new(can: Arc<dyn Transport>, doip: Arc<dyn Transport>) -> Self {
        Self { can, doip }
    }

    /// Transport for a binding
    pub fn for_kind(&self, kind: TransportKind) -> &Arc<dyn Transport> {
        match kind {
            TransportKind::Can => &self.can,
            TransportKind::DoIp => &self.doip,
        }
    }
}

/// Create both transport simulators from configuration
pub fn create_transports(config: &TransportsConfig) -> Result<TransportSet, TransportError> {
    let can = CanTransport::new(&config.can)?;
    let doip = DoIpTransport::new(&config.doip);
    Ok(TransportSet::new(Arc::new(can), Arc::new(doip)))
}
