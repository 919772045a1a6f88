//! Security access session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SecurityLevel;

/// Security session for one ECU
///
/// Snapshots of this type are handed out by the security manager; the live
/// session is owned exclusively by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySession {
    pub session_id: String,
    pub ecu_id: String,
    pub current_level: SecurityLevel,
    /// Pending seed, if one has been issued and not yet consumed
    pub seed: Option<Vec<u8>>,
    /// Level the pending seed unlocks
    pub requested_level: SecurityLevel,
    pub failed_attempts: u32,
    pub expires_at: DateTime<Utc>,
}

impl SecuritySession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Current handshake state
    pub fn state(&self) -> SecurityState {
        if self.seed.is_some() {
            SecurityState::SeedIssued
        } else if self.current_level > SecurityLevel::Default {
            SecurityState::LevelGranted
        } else {
            SecurityState::NoSeed
        }
    }
}

/// Handshake state of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityState {
    /// Session exists at default level with no pending seed
    NoSeed,
    SeedIssued,
    LevelGranted,
}
