//! Chained builder for scenario templates

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;
use tracing::debug;
use udsim_core::{
    DiagnosticScenarioTemplate, UdsServiceRequest, ValidationError, MAX_DESCRIPTION_LEN,
    MAX_NAME_LEN, MAX_PAYLOAD_BYTES,
};

use crate::uds::codec;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `scn-<millis>-<sequence>-<random>`, unique within the process
fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix: u32 = rand::thread_rng().gen();
    format!("scn-{}-{}-{:08x}", millis, sequence, suffix)
}

/// Builds a [`DiagnosticScenarioTemplate`]
///
/// Setters validate eagerly, so a builder never holds an invalid name,
/// description or payload.
///
/// # Example
///
/// ```ignore
/// let template = ScenarioBuilder::new()
///     .set_name("Extended session")?
///     .set_target_ecu("engine_ecu")
///     .add_service(UdsServiceRequest::new(0x10).with_sub_function(0x03))?
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScenarioBuilder {
    name: Option<String>,
    description: String,
    target_ecu: Option<String>,
    services: Vec<UdsServiceRequest>,
    payload_bytes: usize,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<&mut Self, ValidationError> {
        let name = name.into();
        let len = name.chars().count();
        if len > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                len,
                max: MAX_NAME_LEN,
            });
        }
        self.name = Some(name);
        Ok(self)
    }

    pub fn set_description(
        &mut self,
        description: impl Into<String>,
    ) -> Result<&mut Self, ValidationError> {
        let description = description.into();
        let len = description.chars().count();
        if len > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::DescriptionTooLong {
                len,
                max: MAX_DESCRIPTION_LEN,
            });
        }
        self.description = description;
        Ok(self)
    }

    pub fn set_target_ecu(&mut self, ecu_id: impl Into<String>) -> &mut Self {
        self.target_ecu = Some(ecu_id.into());
        self
    }

    /// Append a service; the running data total may not exceed 4096 bytes
    pub fn add_service(
        &mut self,
        request: UdsServiceRequest,
    ) -> Result<&mut Self, ValidationError> {
        if !codec::is_valid_sid(request.sid) {
            return Err(ValidationError::InvalidService(format!(
                "SID 0x{:02X} is below 0x{:02X}",
                request.sid,
                codec::MIN_SID
            )));
        }

        let total = self.payload_bytes + request.data.len();
        if total > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                total,
                max: MAX_PAYLOAD_BYTES,
            });
        }

        self.payload_bytes = total;
        self.services.push(request);
        Ok(self)
    }

    /// Produce a template with a fresh id and timestamps
    pub fn build(&self) -> Result<DiagnosticScenarioTemplate, ValidationError> {
        if self.services.is_empty() {
            return Err(ValidationError::EmptyScenario);
        }
        let name = match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => return Err(ValidationError::MissingName),
        };
        let target_ecu_id = match &self.target_ecu {
            Some(ecu) if !ecu.trim().is_empty() => ecu.clone(),
            _ => return Err(ValidationError::MissingTargetEcu),
        };

        let now = Utc::now();
        let template = DiagnosticScenarioTemplate {
            id: generate_id(),
            name,
            description: self.description.clone(),
            services: self.services.clone(),
            target_ecu_id,
            created_at: now,
            updated_at: now,
            is_template: true,
        };
        debug!(
            id = %template.id,
            services = template.services.len(),
            payload_bytes = self.payload_bytes,
            "Scenario built"
        );
        Ok(template)
    }

    /// Back to the empty initial state
    pub fn reset(&mut self) -> &mut Self {
        *self = Self::default();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn session_request() -> UdsServiceRequest {
        UdsServiceRequest::new(0x10).with_sub_function(0x03)
    }

    #[test]
    fn test_name_length_limit() {
        let mut builder = ScenarioBuilder::new();
        assert!(builder.set_name("a".repeat(64)).is_ok());
        assert_eq!(
            builder.set_name("a".repeat(65)).unwrap_err(),
            ValidationError::NameTooLong { len: 65, max: 64 }
        );
        // Characters, not bytes
        assert!(builder.set_name("ä".repeat(64)).is_ok());
    }

    #[test]
    fn test_description_length_limit() {
        let mut builder = ScenarioBuilder::new();
        assert!(builder.set_description("d".repeat(256)).is_ok());
        assert!(matches!(
            builder.set_description("d".repeat(257)),
            Err(ValidationError::DescriptionTooLong { len: 257, .. })
        ));
    }

    #[test]
    fn test_payload_limit_is_cumulative() {
        let mut builder = ScenarioBuilder::new();
        builder
            .add_service(UdsServiceRequest::new(0x2E).with_data(vec![0u8; 4000]))
            .unwrap();
        builder
            .add_service(UdsServiceRequest::new(0x2E).with_data(vec![0u8; 96]))
            .unwrap();

        let err = builder
            .add_service(UdsServiceRequest::new(0x2E).with_data(vec![0u8; 1]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::PayloadTooLarge {
                total: 4097,
                max: 4096
            }
        );

        // The rejected service was not added
        builder.set_name("Flash").unwrap().set_target_ecu("engine_ecu");
        let template = builder.build().unwrap();
        assert_eq!(template.services.len(), 2);
        assert_eq!(template.payload_size(), 4096);
    }

    #[test]
    fn test_build_requires_services_name_and_ecu() {
        let mut builder = ScenarioBuilder::new();
        assert_eq!(builder.build().unwrap_err(), ValidationError::EmptyScenario);

        builder.add_service(session_request()).unwrap();
        assert_eq!(builder.build().unwrap_err(), ValidationError::MissingName);

        builder.set_name("Extended session").unwrap();
        assert_eq!(builder.build().unwrap_err(), ValidationError::MissingTargetEcu);

        builder.set_target_ecu("engine_ecu");
        let template = builder.build().unwrap();
        assert_eq!(template.name, "Extended session");
        assert_eq!(template.target_ecu_id, "engine_ecu");
        assert!(template.is_template);
        assert_eq!(template.created_at, template.updated_at);
    }

    #[test]
    fn test_rejects_sid_below_range() {
        let mut builder = ScenarioBuilder::new();
        assert!(matches!(
            builder.add_service(UdsServiceRequest::new(0x0F)),
            Err(ValidationError::InvalidService(_))
        ));
    }

    #[test]
    fn test_ids_are_unique_and_reset_clears() {
        let mut builder = ScenarioBuilder::new();
        builder
            .set_name("Ids")
            .unwrap()
            .set_target_ecu("engine_ecu")
            .add_service(session_request())
            .unwrap();

        let ids: HashSet<String> = (0..100).map(|_| builder.build().unwrap().id).collect();
        assert_eq!(ids.len(), 100);

        builder.reset();
        assert_eq!(builder.build().unwrap_err(), ValidationError::EmptyScenario);
        builder.add_service(session_request()).unwrap();
        assert_eq!(builder.build().unwrap_err(), ValidationError::MissingName);
    }
}
