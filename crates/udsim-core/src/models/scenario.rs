//! Scenario templates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UdsServiceRequest;

/// Maximum scenario name length in characters
pub const MAX_NAME_LEN: usize = 64;

/// Maximum scenario description length in characters
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Maximum total data bytes across all services of a scenario
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// A reusable, validated sequence of UDS requests against one ECU
///
/// Produced by the scenario builder; persisted by an external store keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticScenarioTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub services: Vec<UdsServiceRequest>,
    pub target_ecu_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_template: bool,
}

impl DiagnosticScenarioTemplate {
    /// Total data bytes across all services
    pub fn payload_size(&self) -> usize {
        self.services.iter().map(|s| s.data.len()).sum()
    }
}
