//! End-to-end tests for the UDS simulator
//!
//! Everything runs in-process: simulated transports, simulated ECUs and the
//! automation engine, wired together from a TOML config exactly as `udsimd`
//! wires them.
//!
//! # Test Structure
//!
//! - `e2e_test.rs` - Scenario runs through the engine (retry, cancel, security)
//! - `scenario_file_test.rs` - Scenario files loaded from disk
//!
//! This module holds the shared fixture.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use udsim_core::{
    AuditSink, AutomationEvent, DiagnosticAuditEntry, DiagnosticScenarioTemplate, MemoryStore,
    StoreResult, UdsServiceRequest,
};
use udsim_uds::{AutomationEngine, EngineHandle, ScenarioBuilder, SimulatorConfig};

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

/// Simulator config with short latencies and a scripted `engine_ecu`
///
/// `22 DE AD` is answered with NRC 0x31 (requestOutOfRange), `22 F1 90`
/// with a VIN fragment.
pub const FAST_CONFIG: &str = r#"
[worker]
max_concurrent_runs = 4
heartbeat_interval_ms = 60000
timeout_ms = 10000

[transport.can]
latency_ms = 2

[transport.doip]
latency_ms = 1

[[ecus]]
id = "engine_ecu"

[[ecus.responses]]
request = "22 DE AD"
response = "7F 22 31"

[[ecus.responses]]
request = "22 F1 90"
response = "62 F1 90 57 44 42"
"#;

pub fn fast_config() -> SimulatorConfig {
    SimulatorConfig::from_toml(FAST_CONFIG).expect("fixture config is valid")
}

/// Audit sink that forwards to a [`MemoryStore`] and cancels every live run
/// once a given number of entries has been recorded
pub struct CancellingAuditSink {
    inner: Arc<MemoryStore>,
    cancel_after: usize,
    engine: Mutex<Option<EngineHandle>>,
}

impl CancellingAuditSink {
    pub fn new(inner: Arc<MemoryStore>, cancel_after: usize) -> Self {
        Self {
            inner,
            cancel_after,
            engine: Mutex::new(None),
        }
    }

    pub fn attach(&self, engine: EngineHandle) {
        *self.engine.lock() = Some(engine);
    }
}

#[async_trait]
impl AuditSink for CancellingAuditSink {
    async fn record(&self, entry: DiagnosticAuditEntry) -> StoreResult<()> {
        AuditSink::record(&*self.inner, entry).await?;

        if self.inner.audit_entries().len() == self.cancel_after {
            let engine = self.engine.lock().clone();
            if let Some(engine) = engine {
                for run in engine.runs() {
                    if !run.status.is_terminal() {
                        let _ = engine.cancel(&run.id, "operator abort").await;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Engine plus the store behind its audit, metrics and persistence
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub engine: EngineHandle,
}

impl Fixture {
    pub fn new(config: &SimulatorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_audit(config, store.clone(), store)
    }

    /// Fixture whose audit trail goes through `audit` instead of the store
    pub fn with_audit(
        config: &SimulatorConfig,
        audit: Arc<dyn AuditSink>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let engine = AutomationEngine::from_config(config, audit, store.clone())
            .expect("engine builds from fixture config")
            .with_store(store.clone())
            .spawn();
        Self { store, engine }
    }
}

/// Template for `ecu` built through the scenario builder
pub fn template(ecu: &str, services: Vec<UdsServiceRequest>) -> DiagnosticScenarioTemplate {
    let mut builder = ScenarioBuilder::new();
    builder
        .set_name("e2e")
        .expect("name is valid")
        .set_target_ecu(ecu);
    for service in services {
        builder.add_service(service).expect("service is valid");
    }
    builder.build().expect("template is complete")
}

/// Events of `run_id` up to and including its terminal event
pub async fn collect_run(
    events: &mut broadcast::Receiver<AutomationEvent>,
    run_id: &str,
) -> Vec<AutomationEvent> {
    let mut collected = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id() == Some(run_id) => {
                    let terminal = event.is_terminal();
                    collected.push(event);
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    panic!("event stream lagged by {}", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("run finished in time");
    collected
}

/// Wire `type` tag of an event
pub fn event_type(event: &AutomationEvent) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v["type"].as_str().map(str::to_string))
        .unwrap_or_default()
}
