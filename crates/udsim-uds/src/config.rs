//! Simulator configuration
//!
//! Engine, transport, security and ECU settings plus scenario definition
//! files. Everything is loaded from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use udsim_core::{
    AssertionDescriptor, AutomatedTestStep, RunScenarioCommand, SecurityLevel, StepOutcome,
    TransportKind, UdsServiceRequest, ValidationError,
};

use crate::scenario::ScenarioBuilder;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid hex in {field}: {source}")]
    Hex {
        field: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("Invalid scenario: {0}")]
    Scenario(#[from] ValidationError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse a CAN id given as hex (`"0x7E0"`, `"7E0"`)
pub fn parse_can_id(value: &str) -> Result<u32, std::num::ParseIntError> {
    let cleaned = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(cleaned, 16)
}

fn parse_hex(field: &str, value: &str) -> Result<Vec<u8>, ConfigError> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(cleaned).map_err(|source| ConfigError::Hex {
        field: field.to_string(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

// =============================================================================
// Simulator Configuration
// =============================================================================

/// Top-level simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub worker: WorkerConfiguration,
    #[serde(default)]
    pub transport: TransportsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Simulated ECUs; unknown ECU ids get default behaviour
    #[serde(default)]
    pub ecus: Vec<EcuConfig>,
}

impl SimulatorConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&read_file(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.worker.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        parse_can_id(&self.transport.can.tx_id)
            .map_err(|e| ConfigError::Invalid(format!("transport.can.tx_id: {}", e)))?;
        parse_can_id(&self.transport.can.rx_id)
            .map_err(|e| ConfigError::Invalid(format!("transport.can.rx_id: {}", e)))?;
        for ecu in &self.ecus {
            for response in &ecu.responses {
                parse_hex("ecus.responses.request", &response.request)?;
                parse_hex("ecus.responses.response", &response.response)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

/// Automation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfiguration {
    /// Runs admitted at the same time; further runs wait in `queued`
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Default run timeout
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Default retries per failing step
    #[serde(default)]
    pub default_retries: u32,
    /// Persona written to audit entries when a run names none
    #[serde(default = "default_user_persona")]
    pub user_persona: String,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            timeout_ms: default_timeout(),
            default_retries: 0,
            user_persona: default_user_persona(),
        }
    }
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_timeout() -> u64 {
    300_000
}

fn default_user_persona() -> String {
    "automation".to_string()
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Settings for both transport simulators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub doip: DoIpConfig,
}

/// CAN / ISO-TP simulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    /// Fixed per-call delay
    #[serde(default = "default_can_latency")]
    pub latency_ms: u64,
    /// Separation time added per consecutive frame
    #[serde(default)]
    pub st_min_ms: u64,
    /// Transmit CAN ID (tester -> ECU)
    #[serde(default = "default_can_tx_id")]
    pub tx_id: String,
    /// Receive CAN ID (ECU -> tester)
    #[serde(default = "default_can_rx_id")]
    pub rx_id: String,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_can_latency(),
            st_min_ms: 0,
            tx_id: default_can_tx_id(),
            rx_id: default_can_rx_id(),
        }
    }
}

fn default_can_latency() -> u64 {
    50
}

fn default_can_tx_id() -> String {
    "0x7E0".to_string()
}

fn default_can_rx_id() -> String {
    "0x7E8".to_string()
}

/// DoIP simulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoIpConfig {
    /// Fixed per-call delay
    #[serde(default = "default_doip_latency")]
    pub latency_ms: u64,
    /// Tester logical address
    #[serde(default = "default_doip_source_address")]
    pub source_address: u16,
    /// ECU logical address
    #[serde(default = "default_doip_target_address")]
    pub target_address: u16,
}

impl Default for DoIpConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_doip_latency(),
            source_address: default_doip_source_address(),
            target_address: default_doip_target_address(),
        }
    }
}

fn default_doip_latency() -> u64 {
    10
}

fn default_doip_source_address() -> u16 {
    0x0E80
}

fn default_doip_target_address() -> u16 {
    0x1000
}

// =============================================================================
// Security Configuration
// =============================================================================

/// Security access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Lifetime of a security session
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
        }
    }
}

fn default_session_ttl() -> u64 {
    300
}

// =============================================================================
// ECU Configuration
// =============================================================================

/// A simulated ECU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    pub id: String,
    /// Scripted responses, matched exactly first and then by prefix
    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
}

/// Request -> response mapping, both as hex strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedResponse {
    pub request: String,
    pub response: String,
}

impl ScriptedResponse {
    pub fn to_bytes(&self) -> Result<(Vec<u8>, Vec<u8>), ConfigError> {
        Ok((
            parse_hex("request", &self.request)?,
            parse_hex("response", &self.response)?,
        ))
    }
}

// =============================================================================
// Scenario Definitions
// =============================================================================

/// A scenario file
///
/// # Example
/// ```toml
/// name = "Extended session"
/// target_ecu = "engine_ecu"
/// retries = 1
///
/// [[steps]]
/// sid = 0x10
/// sub_function = 0x03
///
/// [[steps.assertions]]
/// type = "equal"
/// path = "data.0"
/// expectedValue = 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_ecu: String,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub user_persona: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// One step of a scenario file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Defaults to `step-N`
    #[serde(default)]
    pub id: Option<String>,
    pub sid: u8,
    #[serde(default)]
    pub sub_function: Option<u8>,
    /// Request data as hex
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub expected_nrc: Vec<u8>,
    /// Defaults to `NRC` when `expected_nrc` is set, `SUCCESS` otherwise
    #[serde(default)]
    pub expected_outcome: Option<StepOutcome>,
    #[serde(default)]
    pub assertions: Vec<AssertionDescriptor>,
}

impl ScenarioDefinition {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&read_file(path.as_ref())?)
    }

    /// Validate through the scenario builder and produce a run command
    pub fn into_command(self) -> Result<RunScenarioCommand, ConfigError> {
        let mut builder = ScenarioBuilder::new();
        builder.set_name(&self.name)?.set_target_ecu(&self.target_ecu);
        if let Some(description) = &self.description {
            builder.set_description(description)?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, def) in self.steps.into_iter().enumerate() {
            let mut request = UdsServiceRequest::new(def.sid)
                .with_data(parse_hex("steps.data", &def.data)?)
                .with_transport(def.transport)
                .with_security_level(def.security_level);
            request.sub_function = def.sub_function;
            request.expected_nrc = def.expected_nrc.into_iter().collect();

            builder.add_service(request.clone())?;

            let mut step = AutomatedTestStep::from_request(
                def.id.unwrap_or_else(|| format!("step-{}", i + 1)),
                request,
            );
            if let Some(outcome) = def.expected_outcome {
                step.expected_outcome = outcome;
            }
            step.assertions = def.assertions;
            steps.push(step);
        }

        let template = builder.build()?;
        let mut command = RunScenarioCommand::new(template).with_steps(steps);
        command.retries = self.retries;
        command.timeout_ms = self.timeout_ms;
        command.user_persona = self.user_persona;
        Ok(command)
    }
}
