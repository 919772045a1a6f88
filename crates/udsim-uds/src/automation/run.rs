//! Shared per-run state

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use udsim_core::{AutomatedTestRun, PauseReason, RunStatus};

/// Control requested by the host, applied by the run task between steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause(PauseReason),
    Cancel(String),
}

/// A run owned by the engine
///
/// The run task is the only writer of `state` once the run is accepted; the
/// dispatcher only reads it and posts [`Control`] values.
pub(crate) struct RunHandle {
    pub(crate) state: Mutex<AutomatedTestRun>,
    pub(crate) control: watch::Sender<Control>,
    pub(crate) timeout: Duration,
    pub(crate) user_persona: String,
    pub(crate) task: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    pub(crate) fn new(
        run: AutomatedTestRun,
        timeout: Duration,
        user_persona: String,
    ) -> (Self, watch::Receiver<Control>) {
        let (control, control_rx) = watch::channel(Control::Run);
        let handle = Self {
            state: Mutex::new(run),
            control,
            timeout,
            user_persona,
            task: Mutex::new(None),
        };
        (handle, control_rx)
    }

    pub(crate) fn snapshot(&self) -> AutomatedTestRun {
        self.state.lock().clone()
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Status the run is heading to once pending control is applied
    pub(crate) fn effective_status(&self) -> RunStatus {
        let status = self.status();
        if status.is_terminal() {
            return status;
        }
        match &*self.control.borrow() {
            Control::Cancel(_) => RunStatus::Cancelled,
            Control::Pause(_) => RunStatus::Paused,
            Control::Run if status == RunStatus::Paused => RunStatus::Running,
            Control::Run => status,
        }
    }

    pub(crate) fn post(&self, control: Control) {
        self.control.send_replace(control);
    }

    pub(crate) fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
