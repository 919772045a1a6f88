//! Automation engine: command inbox, dispatcher and event outbox

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use udsim_core::{
    AuditSink, AutomatedTestRun, AutomatedTestStep, AutomationCommand, AutomationEvent,
    DiagnosticStore, EngineError, EngineResult, MetricsEvent, MetricsSink, PauseReason,
    RunScenarioCommand, RunStatus,
};
use uuid::Uuid;

use super::executor::RunTask;
use super::run::{Control, RunHandle};
use crate::config::{ConfigError, SimulatorConfig, WorkerConfiguration};
use crate::tester::Tester;

const COMMAND_QUEUE_DEPTH: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reply to an accepted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// `RUN_SCENARIO` accepted; the run starts `queued`
    Accepted { run_id: String },
    /// Control command applied (takes effect at the next step boundary)
    Applied,
    /// `PING` answered with a heartbeat event
    Pong,
}

enum Envelope {
    Command(AutomationCommand, oneshot::Sender<EngineResult<CommandReply>>),
    Shutdown(oneshot::Sender<()>),
}

/// State shared by the dispatcher, run tasks and handles
pub(crate) struct EngineShared {
    pub(crate) config: WorkerConfiguration,
    pub(crate) tester: Arc<Tester>,
    pub(crate) store: Option<Arc<dyn DiagnosticStore>>,
    pub(crate) admission: Arc<Semaphore>,
    events: broadcast::Sender<AutomationEvent>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl EngineShared {
    pub(crate) fn emit(&self, event: AutomationEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn run_handle(&self, run_id: &str) -> EngineResult<Arc<RunHandle>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    fn heartbeat(&self) -> AutomationEvent {
        let (mut queued, mut active) = (0, 0);
        for handle in self.runs.read().values() {
            match handle.status() {
                RunStatus::Queued => queued += 1,
                RunStatus::Running | RunStatus::Paused => active += 1,
                _ => {}
            }
        }
        let capacity = self.config.max_concurrent_runs.max(1) as f64;
        AutomationEvent::Heartbeat {
            cpu_utilization: (active as f64 / capacity * 100.0).min(100.0),
            queue_depth: queued,
            active_runs: active,
            timestamp: Utc::now(),
        }
    }
}

/// Automation engine, configured and ready to spawn
pub struct AutomationEngine {
    config: WorkerConfiguration,
    tester: Arc<Tester>,
    store: Option<Arc<dyn DiagnosticStore>>,
}

impl AutomationEngine {
    pub fn new(config: WorkerConfiguration, tester: Arc<Tester>) -> Self {
        Self {
            config,
            tester,
            store: None,
        }
    }

    /// Build the tester stack from configuration
    pub fn from_config(
        config: &SimulatorConfig,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        let tester = Tester::from_config(config, audit)?.with_metrics(metrics);
        Ok(Self::new(config.worker.clone(), Arc::new(tester)))
    }

    /// Persist terminal runs to `store`
    pub fn with_store(mut self, store: Arc<dyn DiagnosticStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tester(&self) -> &Arc<Tester> {
        &self.tester
    }

    /// Start the dispatcher task
    pub fn spawn(self) -> EngineHandle {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let shared = Arc::new(EngineShared {
            admission: Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1))),
            config: self.config,
            tester: self.tester,
            store: self.store,
            events,
            runs: RwLock::new(HashMap::new()),
        });

        info!(
            max_concurrent_runs = shared.config.max_concurrent_runs,
            heartbeat_interval_ms = shared.config.heartbeat_interval_ms,
            "Automation engine started"
        );
        tokio::spawn(dispatch(shared.clone(), inbox));

        EngineHandle { commands, shared }
    }
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Envelope>,
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Apply a command and wait for the dispatcher's verdict
    pub async fn send_command(&self, command: AutomationCommand) -> EngineResult<CommandReply> {
        let (reply, verdict) = oneshot::channel();
        self.commands
            .send(Envelope::Command(command, reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        verdict.await.map_err(|_| EngineError::Closed)?
    }

    /// Start a run; returns its id
    pub async fn run_scenario(&self, command: RunScenarioCommand) -> EngineResult<String> {
        match self
            .send_command(AutomationCommand::RunScenario(command))
            .await?
        {
            CommandReply::Accepted { run_id } => Ok(run_id),
            _ => Err(EngineError::Closed),
        }
    }

    pub async fn pause(&self, run_id: &str, reason: PauseReason) -> EngineResult<()> {
        self.send_command(AutomationCommand::PauseRun {
            run_id: run_id.to_string(),
            reason,
        })
        .await
        .map(|_| ())
    }

    pub async fn resume(&self, run_id: &str) -> EngineResult<()> {
        self.send_command(AutomationCommand::ResumeRun {
            run_id: run_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn cancel(&self, run_id: &str, reason: impl Into<String>) -> EngineResult<()> {
        self.send_command(AutomationCommand::CancelRun {
            run_id: run_id.to_string(),
            reason: reason.into(),
        })
        .await
        .map(|_| ())
    }

    /// Outbound event stream
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of one run
    pub fn run(&self, run_id: &str) -> Option<AutomatedTestRun> {
        self.shared.runs.read().get(run_id).map(|h| h.snapshot())
    }

    /// Snapshots of every run the engine knows
    pub fn runs(&self) -> Vec<AutomatedTestRun> {
        self.shared
            .runs
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    /// Wait until a run reaches a terminal status
    pub async fn wait_for_run(&self, run_id: &str) -> EngineResult<AutomatedTestRun> {
        let mut events = self.subscribe();
        loop {
            let run = self
                .run(run_id)
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
            if run.status.is_terminal() {
                return Ok(run);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() && event.run_id() == Some(run_id) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Closed),
                }
            }
        }
    }

    /// Stop the dispatcher and abort every run task
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Envelope::Shutdown(done)).await.is_ok() {
            let _ = stopped.await;
        }
    }
}

async fn dispatch(shared: Arc<EngineShared>, mut inbox: mpsc::Receiver<Envelope>) {
    let period = Duration::from_millis(shared.config.heartbeat_interval_ms.max(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = inbox.recv() => match envelope {
                Some(Envelope::Command(command, reply)) => {
                    let verdict = apply(&shared, command);
                    if let Err(e) = &verdict {
                        debug!(error = %e, "Command rejected");
                    }
                    let _ = reply.send(verdict);
                }
                Some(Envelope::Shutdown(done)) => {
                    stop_all(&shared);
                    let _ = done.send(());
                    break;
                }
                None => {
                    stop_all(&shared);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                let purged = shared.tester.security().purge_expired();
                if purged > 0 {
                    debug!(purged, "Expired security sessions removed");
                }
                shared.emit(shared.heartbeat());
            }
        }
    }
    info!("Automation engine stopped");
}

fn apply(shared: &Arc<EngineShared>, command: AutomationCommand) -> EngineResult<CommandReply> {
    match command {
        AutomationCommand::RunScenario(command) => start_run(shared, command),
        AutomationCommand::PauseRun { run_id, reason } => {
            let handle = shared.run_handle(&run_id)?;
            let status = handle.effective_status();
            if status != RunStatus::Running {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    from: status,
                    to: RunStatus::Paused,
                });
            }
            debug!(run_id = %run_id, ?reason, "Pause requested");
            handle.post(Control::Pause(reason));
            Ok(CommandReply::Applied)
        }
        AutomationCommand::ResumeRun { run_id } => {
            let handle = shared.run_handle(&run_id)?;
            let status = handle.effective_status();
            if status != RunStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    from: status,
                    to: RunStatus::Running,
                });
            }
            debug!(run_id = %run_id, "Resume requested");
            handle.post(Control::Run);
            Ok(CommandReply::Applied)
        }
        AutomationCommand::CancelRun { run_id, reason } => {
            let handle = shared.run_handle(&run_id)?;
            let status = handle.effective_status();
            if !status.can_transition_to(RunStatus::Cancelled) {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    from: status,
                    to: RunStatus::Cancelled,
                });
            }
            let reason = if reason.trim().is_empty() {
                "cancelled by user".to_string()
            } else {
                reason
            };
            debug!(run_id = %run_id, %reason, "Cancel requested");
            handle.post(Control::Cancel(reason));
            Ok(CommandReply::Applied)
        }
        AutomationCommand::Ping => {
            shared.emit(shared.heartbeat());
            Ok(CommandReply::Pong)
        }
    }
}

fn start_run(shared: &Arc<EngineShared>, command: RunScenarioCommand) -> EngineResult<CommandReply> {
    let run_id = command
        .run_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if shared.runs.read().contains_key(&run_id) {
        return Err(EngineError::DuplicateRun { run_id });
    }

    let scenario = command.scenario;
    let steps = command
        .steps
        .unwrap_or_else(|| AutomatedTestStep::from_template(&scenario));
    if steps.is_empty() {
        return Err(EngineError::EmptyRun);
    }

    let retries = command.retries.unwrap_or(shared.config.default_retries);
    let timeout = Duration::from_millis(command.timeout_ms.unwrap_or(shared.config.timeout_ms));
    let user_persona = command
        .user_persona
        .unwrap_or_else(|| shared.config.user_persona.clone());

    let run = AutomatedTestRun::new(
        &run_id,
        &scenario.id,
        &scenario.target_ecu_id,
        steps,
        retries,
    );
    info!(
        run_id = %run_id,
        scenario_id = %scenario.id,
        ecu_id = %scenario.target_ecu_id,
        steps = run.steps.len(),
        retries,
        "Run accepted"
    );

    let (handle, control) = RunHandle::new(run, timeout, user_persona);
    let handle = Arc::new(handle);
    shared.runs.write().insert(run_id.clone(), handle.clone());

    shared.tester.metrics().emit(MetricsEvent::TemplateRun {
        template_id: scenario.id.clone(),
        run_id: run_id.clone(),
        timestamp: Utc::now(),
    });

    let task = RunTask::new(shared.clone(), handle.clone(), control);
    *handle.task.lock() = Some(tokio::spawn(task.run()));

    Ok(CommandReply::Accepted { run_id })
}

fn stop_all(shared: &EngineShared) {
    shared.admission.close();
    let runs = shared.runs.read();
    let mut aborted = 0;
    for handle in runs.values() {
        if !handle.status().is_terminal() {
            aborted += 1;
        }
        handle.abort();
    }
    if aborted > 0 {
        warn!(aborted, "Engine stopped with unfinished runs");
    }
}
