//! Security session table
//!
//! The manager is the single owner of every [`SecuritySession`]. Callers
//! address sessions by id and get snapshots back; there is at most one live
//! session per ECU.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use udsim_core::{SecurityError, SecurityLevel, SecuritySession};
use uuid::Uuid;

use super::key::{generate_seed, key_matches};
use crate::config::SecurityConfig;

/// Consecutive invalid keys before the session is locked
pub const MAX_FAILED_ATTEMPTS: u32 = 3;

/// Verdict of a key validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Key accepted, level granted, seed consumed
    Granted(SecurityLevel),
    /// Key rejected; the seed stays valid for `remaining` more attempts
    Invalid { remaining: u32 },
    /// Third consecutive invalid key; seed cleared and level reset to default
    Locked,
}

/// Owner of all security sessions, keyed by ECU id
pub struct SecurityManager {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SecuritySession>>,
    /// Per-ECU handshake leases
    ecu_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SecurityManager {
    pub fn new(config: &SecurityConfig) -> Self {
        Self::with_ttl(Duration::from_secs(config.session_ttl_secs))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
            ecu_locks: Mutex::new(HashMap::new()),
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    /// Start a new session for `ecu_id`, superseding any existing one
    pub fn create_session(&self, ecu_id: &str) -> SecuritySession {
        let session = SecuritySession {
            session_id: Uuid::new_v4().to_string(),
            ecu_id: ecu_id.to_string(),
            current_level: SecurityLevel::Default,
            seed: None,
            requested_level: SecurityLevel::Default,
            failed_attempts: 0,
            expires_at: self.expiry_from(Utc::now()),
        };

        let previous = self
            .sessions
            .lock()
            .insert(ecu_id.to_string(), session.clone());
        if let Some(previous) = previous {
            debug!(ecu_id, superseded = %previous.session_id, "Security session superseded");
        }
        info!(ecu_id, session_id = %session.session_id, "Security session created");
        session
    }

    /// Live session for `ecu_id`, creating one if there is none
    pub fn ensure_session(&self, ecu_id: &str) -> SecuritySession {
        match self.session_for_ecu(ecu_id) {
            Some(session) => session,
            None => self.create_session(ecu_id),
        }
    }

    /// Issue a seed unlocking the supplier level
    pub fn generate_seed(&self, session_id: &str) -> Result<Vec<u8>, SecurityError> {
        self.request_seed(session_id, SecurityLevel::Supplier)
    }

    /// Issue a seed unlocking `level`
    ///
    /// Replaces any pending seed and resets the failed-attempt counter.
    pub fn request_seed(
        &self,
        session_id: &str,
        level: SecurityLevel,
    ) -> Result<Vec<u8>, SecurityError> {
        self.with_live_session(session_id, |session| {
            let seed = generate_seed();
            session.seed = Some(seed.clone());
            session.requested_level = level;
            session.failed_attempts = 0;
            info!(
                ecu_id = %session.ecu_id,
                level = %level,
                seed = %hex::encode(&seed),
                "Security seed issued"
            );
            Ok(seed)
        })
    }

    /// Validate a key, returning `true` only when access is granted
    pub fn validate_key(&self, session_id: &str, key: &[u8]) -> bool {
        matches!(
            self.verify_key(session_id, key),
            Ok(KeyOutcome::Granted(_))
        )
    }

    /// Validate a key against the pending seed
    pub fn verify_key(&self, session_id: &str, key: &[u8]) -> Result<KeyOutcome, SecurityError> {
        self.with_live_session(session_id, |session| {
            let Some(seed) = session.seed.as_deref() else {
                return Err(SecurityError::NoSeed(session.session_id.clone()));
            };

            if key_matches(seed, key) {
                session.seed = None;
                session.failed_attempts = 0;
                session.current_level = session.requested_level;
                info!(ecu_id = %session.ecu_id, level = %session.current_level, "Security access granted");
                return Ok(KeyOutcome::Granted(session.current_level));
            }

            session.failed_attempts += 1;
            if session.failed_attempts >= MAX_FAILED_ATTEMPTS {
                session.seed = None;
                session.current_level = SecurityLevel::Default;
                warn!(
                    ecu_id = %session.ecu_id,
                    attempts = session.failed_attempts,
                    "Security access locked after invalid keys"
                );
                return Ok(KeyOutcome::Locked);
            }

            let remaining = MAX_FAILED_ATTEMPTS - session.failed_attempts;
            debug!(ecu_id = %session.ecu_id, remaining, "Invalid security key");
            Ok(KeyOutcome::Invalid { remaining })
        })
    }

    /// Snapshot of a live session
    pub fn session(&self, session_id: &str) -> Option<SecuritySession> {
        self.with_live_session(session_id, |session| Ok(session.clone()))
            .ok()
    }

    /// Snapshot of the live session for an ECU
    pub fn session_for_ecu(&self, ecu_id: &str) -> Option<SecuritySession> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        match sessions.get(ecu_id) {
            Some(session) if session.is_expired_at(now) => {
                debug!(ecu_id, "Security session expired");
                sessions.remove(ecu_id);
                None
            }
            Some(session) => Some(session.clone()),
            None => None,
        }
    }

    /// Active level for an ECU (`default` without a live session)
    pub fn current_level(&self, ecu_id: &str) -> SecurityLevel {
        self.session_for_ecu(ecu_id)
            .map(|s| s.current_level)
            .unwrap_or_default()
    }

    /// Check that the ECU's active level is at least `required`
    pub fn check_access(&self, ecu_id: &str, required: SecurityLevel) -> Result<(), SecurityError> {
        let current = self.current_level(ecu_id);
        if current < required {
            return Err(SecurityError::AccessDenied { required, current });
        }
        Ok(())
    }

    /// Drop the session for an ECU; returns whether one existed
    pub fn invalidate(&self, ecu_id: &str) -> bool {
        let removed = self.sessions.lock().remove(ecu_id).is_some();
        if removed {
            info!(ecu_id, "Security session invalidated");
        }
        removed
    }

    /// Remove every expired session; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        before - sessions.len()
    }

    /// Exclusive handshake lease for an ECU
    ///
    /// Held by whoever drives a seed/key exchange so two runs cannot
    /// interleave their handshakes on the same ECU.
    pub async fn lock_ecu(&self, ecu_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .ecu_locks
            .lock()
            .entry(ecu_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn with_live_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SecuritySession) -> Result<T, SecurityError>,
    ) -> Result<T, SecurityError> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let Some(ecu_id) = sessions
            .values()
            .find(|s| s.session_id == session_id)
            .map(|s| s.ecu_id.clone())
        else {
            return Err(SecurityError::NoSession(session_id.to_string()));
        };

        let expired = sessions
            .get(&ecu_id)
            .is_some_and(|session| session.is_expired_at(now));
        if expired {
            debug!(ecu_id = %ecu_id, session_id, "Security session expired");
            sessions.remove(&ecu_id);
            return Err(SecurityError::NoSession(session_id.to_string()));
        }

        match sessions.get_mut(&ecu_id) {
            Some(session) => f(session),
            None => Err(SecurityError::NoSession(session_id.to_string())),
        }
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::compute_key;
    use udsim_core::SecurityState;

    #[test]
    fn test_seed_key_handshake() {
        let manager = SecurityManager::default();
        let session = manager.create_session("engine_ecu");
        assert_eq!(session.current_level, SecurityLevel::Default);
        assert_eq!(session.state(), SecurityState::NoSeed);

        let seed = manager.generate_seed(&session.session_id).unwrap();
        assert_eq!(seed.len(), 4);
        let snapshot = manager.session(&session.session_id).unwrap();
        assert_eq!(snapshot.state(), SecurityState::SeedIssued);

        assert!(manager.validate_key(&session.session_id, &compute_key(&seed)));
        let snapshot = manager.session(&session.session_id).unwrap();
        assert_eq!(snapshot.state(), SecurityState::LevelGranted);
        assert_eq!(snapshot.current_level, SecurityLevel::Supplier);
        assert!(snapshot.seed.is_none());
        assert_eq!(manager.current_level("engine_ecu"), SecurityLevel::Supplier);
    }

    #[test]
    fn test_lockout_after_three_invalid_keys() {
        let manager = SecurityManager::default();
        let session = manager.create_session("engine_ecu");
        let id = &session.session_id;
        let seed = manager.request_seed(id, SecurityLevel::Oem).unwrap();
        let wrong = seed.clone();

        assert_eq!(
            manager.verify_key(id, &wrong),
            Ok(KeyOutcome::Invalid { remaining: 2 })
        );
        assert_eq!(
            manager.verify_key(id, &wrong),
            Ok(KeyOutcome::Invalid { remaining: 1 })
        );
        assert_eq!(manager.verify_key(id, &wrong), Ok(KeyOutcome::Locked));

        let snapshot = manager.session(id).unwrap();
        assert!(snapshot.seed.is_none());
        assert_eq!(snapshot.current_level, SecurityLevel::Default);
        assert_eq!(snapshot.failed_attempts, 3);

        // The old seed is gone, even the correct key is refused
        assert_eq!(
            manager.verify_key(id, &compute_key(&seed)),
            Err(SecurityError::NoSeed(id.clone()))
        );

        // A fresh seed resets the counter and the correct key succeeds
        let seed = manager.request_seed(id, SecurityLevel::Oem).unwrap();
        assert_eq!(manager.session(id).unwrap().failed_attempts, 0);
        assert_eq!(
            manager.verify_key(id, &compute_key(&seed)),
            Ok(KeyOutcome::Granted(SecurityLevel::Oem))
        );
    }

    #[test]
    fn test_validate_key_without_session_or_seed() {
        let manager = SecurityManager::default();
        assert!(!manager.validate_key("missing", &[0x00]));

        let session = manager.create_session("engine_ecu");
        assert!(!manager.validate_key(&session.session_id, &[0xFF; 4]));
        assert_eq!(
            manager.verify_key(&session.session_id, &[0xFF; 4]),
            Err(SecurityError::NoSeed(session.session_id.clone()))
        );
    }

    #[test]
    fn test_new_session_supersedes_previous() {
        let manager = SecurityManager::default();
        let first = manager.create_session("engine_ecu");
        let seed = manager.generate_seed(&first.session_id).unwrap();
        assert!(manager.validate_key(&first.session_id, &compute_key(&seed)));

        let second = manager.create_session("engine_ecu");
        assert_ne!(first.session_id, second.session_id);
        assert!(manager.session(&first.session_id).is_none());
        assert_eq!(
            manager.generate_seed(&first.session_id),
            Err(SecurityError::NoSession(first.session_id.clone()))
        );
        assert_eq!(manager.current_level("engine_ecu"), SecurityLevel::Default);
    }

    #[test]
    fn test_expired_session_is_not_renewed() {
        let manager = SecurityManager::with_ttl(Duration::ZERO);
        let session = manager.create_session("engine_ecu");

        assert_eq!(
            manager.generate_seed(&session.session_id),
            Err(SecurityError::NoSession(session.session_id.clone()))
        );
        assert!(manager.session(&session.session_id).is_none());
        assert!(manager.session_for_ecu("engine_ecu").is_none());
        assert_eq!(manager.current_level("engine_ecu"), SecurityLevel::Default);
    }

    #[test]
    fn test_purge_and_invalidate() {
        let manager = SecurityManager::with_ttl(Duration::ZERO);
        manager.create_session("a");
        manager.create_session("b");
        assert_eq!(manager.purge_expired(), 2);

        let manager = SecurityManager::default();
        manager.create_session("a");
        assert!(manager.invalidate("a"));
        assert!(!manager.invalidate("a"));
    }

    #[test]
    fn test_check_access() {
        let manager = SecurityManager::default();
        assert!(manager.check_access("engine_ecu", SecurityLevel::Default).is_ok());
        assert_eq!(
            manager.check_access("engine_ecu", SecurityLevel::Supplier),
            Err(SecurityError::AccessDenied {
                required: SecurityLevel::Supplier,
                current: SecurityLevel::Default,
            })
        );

        let session = manager.create_session("engine_ecu");
        let seed = manager.request_seed(&session.session_id, SecurityLevel::Oem).unwrap();
        manager.verify_key(&session.session_id, &compute_key(&seed)).unwrap();
        assert!(manager.check_access("engine_ecu", SecurityLevel::Supplier).is_ok());
        assert!(manager.check_access("engine_ecu", SecurityLevel::Oem).is_ok());
    }

    #[tokio::test]
    async fn test_lock_ecu_serializes_per_ecu() {
        let manager = Arc::new(SecurityManager::default());
        let guard = manager.lock_ecu("engine_ecu").await;

        // Another ECU is independent
        let _other = manager.lock_ecu("body_ecu").await;

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _guard = manager.lock_ecu("engine_ecu").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
