//! udsim-uds - UDS tester/ECU simulation and scenario automation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     AutomationEngine                          │
//! │  command inbox ──► dispatcher ──► run tasks ──► event outbox  │
//! │                                      │                        │
//! │                                ┌─────┴─────┐                  │
//! │                                │  Tester   │                  │
//! │                                └─────┬─────┘                  │
//! │     ┌──────────────┬─────────────────┼──────────────┐         │
//! │ ┌───┴────┐  ┌──────┴──────┐  ┌───────┴──────┐ ┌─────┴──────┐  │
//! │ │ Codec  │  │ SecurityMgr │  │ Transport    │ │SimulatedEcu│  │
//! │ │(uds)   │  │ (sessions)  │  │ (CAN / DoIP) │ │ (responder)│  │
//! │ └────────┘  └─────────────┘  └──────────────┘ └────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod automation;
pub mod config;
pub mod ecu;
pub mod scenario;
pub mod security;
pub mod tester;
pub mod transport;
pub mod uds;

pub use automation::{AutomationEngine, EngineHandle};
pub use config::{ConfigError, ScenarioDefinition, SimulatorConfig, WorkerConfiguration};
pub use ecu::SimulatedEcu;
pub use scenario::ScenarioBuilder;
pub use security::{compute_key, KeyOutcome, SecurityManager};
pub use tester::{Exchange, Tester};
pub use transport::{create_transports, Transport, TransportError, TransportSet};
pub use uds::{codec, NegativeResponseCode};

pub use udsim_core::{
    AutomatedTestRun, AutomatedTestStep, AutomationCommand, AutomationEvent,
    DiagnosticAuditEntry, DiagnosticScenarioTemplate, MemoryStore, RunStatus, SecurityLevel,
    TransportKind, UdsServiceRequest, UdsServiceResponse,
};
