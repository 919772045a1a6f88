//! Diagnostic audit records

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SecurityLevel, TransportKind};

/// How long audit entries are retained by the store's cleanup policy
pub const AUDIT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Result of one audited exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    /// Positive response
    Success,
    /// Negative response
    Nrc,
    /// No decodable response (transport, codec or security gate failure)
    Error,
}

/// One entry per executed step or ad-hoc request; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticAuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_persona: String,
    /// `None` for ad-hoc requests
    #[serde(default)]
    pub scenario_id: Option<String>,
    pub ecu_id: String,
    pub service_sid: u8,
    pub transport: TransportKind,
    pub security_level_used: SecurityLevel,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrc_code: Option<u8>,
    pub duration_ms: u64,
}
