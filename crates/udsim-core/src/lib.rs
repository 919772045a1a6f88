//! udsim-core - Core types and contracts for the UDS diagnostic simulator
//!
//! This crate defines the shared data model (requests, responses, scenario
//! templates, security sessions, automation runs, audit entries), the error
//! kinds every layer reports, and the persistence / audit / metrics contracts
//! that external collaborators implement.

pub mod error;
pub mod memory;
pub mod models;
pub mod store;

pub use error::{
    AssertionFailure, CodecError, EngineError, EngineResult, SecurityError, StoreError,
    StoreResult, ValidationError,
};
pub use memory::MemoryStore;
pub use models::*;
pub use store::{AuditSink, DiagnosticStore, MetricsSink, NoopMetrics};
