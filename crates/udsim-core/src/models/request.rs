//! UDS request / response models

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulated transport binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// CAN with ISO-TP segmentation
    #[default]
    #[serde(rename = "CAN", alias = "can")]
    Can,
    /// Diagnostics over IP (ISO 13400)
    #[serde(rename = "DoIP", alias = "doip")]
    DoIp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Can => write!(f, "CAN"),
            TransportKind::DoIp => write!(f, "DoIP"),
        }
    }
}

/// Security access level, ordered from least to most privileged
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Default,
    Supplier,
    Oem,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Default => write!(f, "default"),
            SecurityLevel::Supplier => write!(f, "supplier"),
            SecurityLevel::Oem => write!(f, "oem"),
        }
    }
}

/// A UDS request as authored in a scenario
///
/// Immutable once constructed; the builder-style `with_*` methods consume
/// and return the request so it can be assembled in one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdsServiceRequest {
    pub sid: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_function: Option<u8>,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub security_level_required: SecurityLevel,
    /// NRCs this request is expected to provoke (empty = expect positive)
    #[serde(default)]
    pub expected_nrc: BTreeSet<u8>,
}

impl UdsServiceRequest {
    pub fn new(sid: u8) -> Self {
        Self {
            sid,
            sub_function: None,
            data: Vec::new(),
            transport: TransportKind::Can,
            security_level_required: SecurityLevel::Default,
            expected_nrc: BTreeSet::new(),
        }
    }

    pub fn with_sub_function(mut self, sub_function: u8) -> Self {
        self.sub_function = Some(sub_function);
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level_required = level;
        self
    }

    pub fn expecting_nrc(mut self, nrc: u8) -> Self {
        self.expected_nrc.insert(nrc);
        self
    }
}

/// A decoded UDS response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdsServiceResponse {
    /// Service id of the request this answers
    pub sid: u8,
    pub data: Vec<u8>,
    pub is_positive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrc: Option<u8>,
}

impl UdsServiceResponse {
    pub fn positive(sid: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            sid,
            data: data.into(),
            is_positive: true,
            nrc: None,
        }
    }

    pub fn negative(sid: u8, nrc: u8) -> Self {
        Self {
            sid,
            data: Vec::new(),
            is_positive: false,
            nrc: Some(nrc),
        }
    }
}
