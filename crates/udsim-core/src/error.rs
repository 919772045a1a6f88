//! Error kinds shared by every layer of the simulator

use thiserror::Error;

use crate::models::{RunStatus, SecurityLevel};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for automation engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while decoding raw response bytes
///
/// Always surfaced to the caller, never silently recovered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Zero-length response
    #[error("Empty response")]
    EmptyResponse,

    /// A 0x7F-prefixed response shorter than three bytes
    #[error("Malformed negative response: expected at least 3 bytes, got {len}")]
    MalformedNegativeResponse { len: usize },
}

/// Scenario builder validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Scenario name is {len} characters, maximum is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("Scenario description is {len} characters, maximum is {max}")]
    DescriptionTooLong { len: usize, max: usize },

    #[error("Scenario payload would be {total} bytes, maximum is {max}")]
    PayloadTooLarge { total: usize, max: usize },

    #[error("Scenario has no services")]
    EmptyScenario,

    #[error("Scenario name is not set")]
    MissingName,

    #[error("Scenario target ECU is not set")]
    MissingTargetEcu,

    #[error("Invalid service: {0}")]
    InvalidService(String),
}

/// Security access errors
///
/// These surface as step failures, never as fatal engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// No live session with that id (never created, superseded or expired)
    #[error("No security session: {0}")]
    NoSession(String),

    /// Key sent without a pending seed
    #[error("No seed issued for session {0}")]
    NoSeed(String),

    /// Active level is below what the request requires
    #[error("Security access denied: requires {required}, current level is {current}")]
    AccessDenied {
        required: SecurityLevel,
        current: SecurityLevel,
    },
}

/// A single assertion mismatch, aggregated into the step failure detail
#[derive(Debug, Error, Clone, PartialEq)]
#[error("assertion #{index} ({kind}) failed: {message}")]
pub struct AssertionFailure {
    /// Position of the assertion within the step
    pub index: usize,
    /// Assertion kind (`equal`, `range`, `nrc`)
    pub kind: &'static str,
    /// Human-readable mismatch description
    pub message: String,
}

/// Errors reported by persistence collaborators
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Template name already used by another persisted template
    #[error("Template name already exists: {0}")]
    DuplicateName(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Automation engine errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The dispatcher task is gone
    #[error("Automation engine is not running")]
    Closed,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} already exists")]
    DuplicateRun { run_id: String },

    /// Command not valid in the run's current state
    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    /// Run exceeded its configured timeout
    #[error("Run timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Scenario has no steps")]
    EmptyRun,
}
