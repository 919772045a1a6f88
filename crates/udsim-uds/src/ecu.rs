//! Simulated ECU
//!
//! The transports only echo, so the ECU turns an echoed request into the
//! response bytes a real server would send back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{ConfigError, EcuConfig};
use crate::security::{level_for_sub_function, KeyOutcome, SecurityManager};
use crate::uds::codec::{self, negative_response, positive_response};
use crate::uds::{security_sub_function, service_id, session_type, NegativeResponseCode};

/// One simulated diagnostic server
pub struct SimulatedEcu {
    id: String,
    security: Arc<SecurityManager>,
    /// Scripted request -> response pairs, in configuration order
    responses: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SimulatedEcu {
    pub fn new(id: impl Into<String>, security: Arc<SecurityManager>) -> Self {
        Self {
            id: id.into(),
            security,
            responses: Vec::new(),
        }
    }

    pub fn from_config(config: &EcuConfig, security: Arc<SecurityManager>) -> Result<Self, ConfigError> {
        let mut ecu = Self::new(&config.id, security);
        for scripted in &config.responses {
            let (request, response) = scripted.to_bytes()?;
            ecu = ecu.with_response(request, response);
        }
        Ok(ecu)
    }

    /// Script a response for a request (or request prefix)
    pub fn with_response(mut self, request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        self.responses.push((request.into(), response.into()));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Answer a request
    ///
    /// SecurityAccess is always served by the security manager. Otherwise a
    /// scripted response wins (exact match, then prefix match); the fallback
    /// is a positive response echoing the request parameters.
    pub fn handle(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return negative_response(0x00, NegativeResponseCode::INCORRECT_MESSAGE_LENGTH.0);
        };

        if sid == service_id::SECURITY_ACCESS {
            return self.handle_security_access(request);
        }

        if let Some(response) = self.find_response(request) {
            debug!(ecu_id = %self.id, sid = format!("0x{:02X}", sid), "Scripted response");
            return response;
        }

        if !codec::is_practical_sid(sid) {
            debug!(ecu_id = %self.id, sid = format!("0x{:02X}", sid), "Unsupported service");
            return negative_response(sid, NegativeResponseCode::SERVICE_NOT_SUPPORTED.0);
        }

        if sid == service_id::DIAGNOSTIC_SESSION_CONTROL {
            self.handle_session_control(request);
        }

        positive_response(sid, &request[1..])
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        if let Some((_, response)) = self.responses.iter().find(|(req, _)| req == request) {
            return Some(response.clone());
        }
        self.responses
            .iter()
            .find(|(req, _)| !req.is_empty() && request.starts_with(req))
            .map(|(_, response)| response.clone())
    }

    fn handle_session_control(&self, request: &[u8]) {
        // Returning to the default session re-locks security access
        if request.get(1) == Some(&session_type::DEFAULT) && self.security.invalidate(&self.id) {
            info!(ecu_id = %self.id, "Default session: security access reset");
        }
    }

    fn handle_security_access(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sub_function) = request.get(1) else {
            return negative_response(
                service_id::SECURITY_ACCESS,
                NegativeResponseCode::INCORRECT_MESSAGE_LENGTH.0,
            );
        };
        let level = level_for_sub_function(sub_function);

        if security_sub_function::is_request_seed(sub_function) {
            let session = self.security.ensure_session(&self.id);
            return match self.security.request_seed(&session.session_id, level) {
                Ok(seed) => {
                    let mut data = vec![sub_function];
                    data.extend_from_slice(&seed);
                    positive_response(service_id::SECURITY_ACCESS, &data)
                }
                Err(e) => {
                    debug!(ecu_id = %self.id, error = %e, "Seed request rejected");
                    negative_response(
                        service_id::SECURITY_ACCESS,
                        NegativeResponseCode::CONDITIONS_NOT_CORRECT.0,
                    )
                }
            };
        }

        let sequence_error = negative_response(
            service_id::SECURITY_ACCESS,
            NegativeResponseCode::REQUEST_SEQUENCE_ERROR.0,
        );
        let Some(session) = self.security.session_for_ecu(&self.id) else {
            return sequence_error;
        };
        if session.seed.is_some() && session.requested_level != level {
            debug!(ecu_id = %self.id, "Key sent for a different level than the seed");
            return sequence_error;
        }

        match self.security.verify_key(&session.session_id, &request[2..]) {
            Ok(KeyOutcome::Granted(_)) => {
                positive_response(service_id::SECURITY_ACCESS, &[sub_function])
            }
            Ok(KeyOutcome::Invalid { .. }) => negative_response(
                service_id::SECURITY_ACCESS,
                NegativeResponseCode::INVALID_KEY.0,
            ),
            Ok(KeyOutcome::Locked) => negative_response(
                service_id::SECURITY_ACCESS,
                NegativeResponseCode::EXCEEDED_NUMBER_OF_ATTEMPTS.0,
            ),
            Err(_) => sequence_error,
        }
    }
}

/// Simulated ECUs by id
///
/// Unknown ids get a default ECU on first use.
pub struct EcuRegistry {
    security: Arc<SecurityManager>,
    ecus: RwLock<HashMap<String, Arc<SimulatedEcu>>>,
}

impl EcuRegistry {
    pub fn new(security: Arc<SecurityManager>) -> Self {
        Self {
            security,
            ecus: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(
        configs: &[EcuConfig],
        security: Arc<SecurityManager>,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new(security.clone());
        for config in configs {
            registry.insert(SimulatedEcu::from_config(config, security.clone())?);
        }
        Ok(registry)
    }

    pub fn insert(&self, ecu: SimulatedEcu) {
        self.ecus.write().insert(ecu.id.clone(), Arc::new(ecu));
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// ECU for `id`, created with default behaviour if unknown
    pub fn get(&self, id: &str) -> Arc<SimulatedEcu> {
        if let Some(ecu) = self.ecus.read().get(id) {
            return ecu.clone();
        }
        self.ecus
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SimulatedEcu::new(id, self.security.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptedResponse;
    use crate::security::compute_key;
    use udsim_core::SecurityLevel;

    fn ecu() -> SimulatedEcu {
        SimulatedEcu::new("engine_ecu", Arc::new(SecurityManager::default()))
    }

    #[test]
    fn test_default_positive_response() {
        let ecu = ecu();
        assert_eq!(ecu.handle(&[0x10, 0x03]), vec![0x50, 0x03]);
        assert_eq!(ecu.handle(&[0x3E, 0x00]), vec![0x7E, 0x00]);
        assert_eq!(ecu.handle(&[0x86]), vec![0x7F, 0x86, 0x11]);
    }

    #[test]
    fn test_scripted_exact_then_prefix() {
        let ecu = ecu()
            .with_response(vec![0x22, 0xF1], vec![0x7F, 0x22, 0x31])
            .with_response(vec![0x22, 0xF1, 0x90], vec![0x62, 0xF1, 0x90, 0x41]);

        assert_eq!(ecu.handle(&[0x22, 0xF1, 0x90]), vec![0x62, 0xF1, 0x90, 0x41]);
        assert_eq!(ecu.handle(&[0x22, 0xF1, 0x86]), vec![0x7F, 0x22, 0x31]);
        assert_eq!(ecu.handle(&[0x22, 0x00, 0x01]), vec![0x62, 0x00, 0x01]);
    }

    #[test]
    fn test_security_access_handshake() {
        let ecu = ecu();
        let response = ecu.handle(&[0x27, 0x03]);
        assert_eq!(&response[..2], &[0x67, 0x03]);
        let seed = &response[2..];
        assert_eq!(seed.len(), 4);

        let mut send_key = vec![0x27, 0x04];
        send_key.extend(compute_key(seed));
        assert_eq!(ecu.handle(&send_key), vec![0x67, 0x04]);
        assert_eq!(ecu.security.current_level("engine_ecu"), SecurityLevel::Oem);

        // Back to the default session drops the granted level
        assert_eq!(ecu.handle(&[0x10, 0x01]), vec![0x50, 0x01]);
        assert_eq!(ecu.security.current_level("engine_ecu"), SecurityLevel::Default);
    }

    #[test]
    fn test_security_access_negative_responses() {
        let ecu = ecu();
        assert_eq!(ecu.handle(&[0x27]), vec![0x7F, 0x27, 0x13]);
        assert_eq!(ecu.handle(&[0x27, 0x02, 0x00]), vec![0x7F, 0x27, 0x24]);

        let response = ecu.handle(&[0x27, 0x01]);
        let seed = response[2..].to_vec();

        // Key for the wrong level
        let mut oem_key = vec![0x27, 0x04];
        oem_key.extend(compute_key(&seed));
        assert_eq!(ecu.handle(&oem_key), vec![0x7F, 0x27, 0x24]);

        let mut wrong = vec![0x27, 0x02];
        wrong.extend(&seed);
        assert_eq!(ecu.handle(&wrong), vec![0x7F, 0x27, 0x35]);
        assert_eq!(ecu.handle(&wrong), vec![0x7F, 0x27, 0x35]);
        assert_eq!(ecu.handle(&wrong), vec![0x7F, 0x27, 0x36]);

        let mut right = vec![0x27, 0x02];
        right.extend(compute_key(&seed));
        assert_eq!(ecu.handle(&right), vec![0x7F, 0x27, 0x24]);
    }

    #[test]
    fn test_registry_creates_unknown_ecus() {
        let security = Arc::new(SecurityManager::default());
        let configs = vec![EcuConfig {
            id: "body_ecu".to_string(),
            responses: vec![ScriptedResponse {
                request: "22F190".to_string(),
                response: "62F19057".to_string(),
            }],
        }];
        let registry = EcuRegistry::from_config(&configs, security).unwrap();

        let body = registry.get("body_ecu");
        assert_eq!(body.handle(&[0x22, 0xF1, 0x90]), vec![0x62, 0xF1, 0x90, 0x57]);

        let unknown = registry.get("gateway");
        assert_eq!(unknown.id(), "gateway");
        assert!(Arc::ptr_eq(&unknown, &registry.get("gateway")));
    }
}
