//! Command / event channel types exchanged with the automation engine host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    AutomatedTestStep, DiagnosticScenarioTemplate, FailureReason, PauseReason, RunSummary,
    TransportKind, UdsServiceResponse,
};

/// Request to start a run of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScenarioCommand {
    /// Run id to use; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub scenario: DiagnosticScenarioTemplate,
    /// Explicit steps; derived one-per-service from the scenario when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<AutomatedTestStep>>,
    /// Retries per failing step (engine default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Run timeout (engine default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
}

impl RunScenarioCommand {
    pub fn new(scenario: DiagnosticScenarioTemplate) -> Self {
        Self {
            run_id: None,
            scenario,
            steps: None,
            retries: None,
            timeout_ms: None,
            user_persona: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<AutomatedTestStep>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_user_persona(mut self, persona: impl Into<String>) -> Self {
        self.user_persona = Some(persona.into());
        self
    }
}

/// Inbound commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum AutomationCommand {
    RunScenario(RunScenarioCommand),
    PauseRun {
        run_id: String,
        #[serde(default)]
        reason: PauseReason,
    },
    ResumeRun {
        run_id: String,
    },
    CancelRun {
        run_id: String,
        #[serde(default)]
        reason: String,
    },
    Ping,
}

/// Raw exchange record for UI tracing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportExchange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub ecu_id: String,
    pub transport: TransportKind,
    /// Request bytes as hex
    pub request: String,
    /// Response bytes as hex
    pub response: String,
    /// Frames on the wire (ISO-TP frames for CAN, 1 for DoIP)
    pub frames: u32,
    /// Transport framing bytes on top of the UDS payload
    pub overhead_bytes: u32,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outbound events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum AutomationEvent {
    RunStarted {
        run_id: String,
        scenario_id: String,
        total_steps: usize,
        started_at: DateTime<Utc>,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        attempt: u32,
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<UdsServiceResponse>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    RunCompleted {
        run_id: String,
        summary: RunSummary,
    },
    RunFailed {
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failing_step_id: Option<String>,
        error_message: String,
        reason: FailureReason,
        summary: RunSummary,
    },
    RunPaused {
        run_id: String,
        reason: PauseReason,
    },
    RunResumed {
        run_id: String,
    },
    RunCancelled {
        run_id: String,
        reason: String,
    },
    Heartbeat {
        cpu_utilization: f64,
        queue_depth: usize,
        active_runs: usize,
        timestamp: DateTime<Utc>,
    },
    TransportExchange(TransportExchange),
}

impl AutomationEvent {
    /// Run this event belongs to (`None` for heartbeats)
    pub fn run_id(&self) -> Option<&str> {
        match self {
            AutomationEvent::RunStarted { run_id, .. }
            | AutomationEvent::StepStarted { run_id, .. }
            | AutomationEvent::StepCompleted { run_id, .. }
            | AutomationEvent::RunCompleted { run_id, .. }
            | AutomationEvent::RunFailed { run_id, .. }
            | AutomationEvent::RunPaused { run_id, .. }
            | AutomationEvent::RunResumed { run_id }
            | AutomationEvent::RunCancelled { run_id, .. } => Some(run_id),
            AutomationEvent::TransportExchange(exchange) => exchange.run_id.as_deref(),
            AutomationEvent::Heartbeat { .. } => None,
        }
    }

    /// Step this event belongs to, if any
    pub fn step_id(&self) -> Option<&str> {
        match self {
            AutomationEvent::StepStarted { step_id, .. }
            | AutomationEvent::StepCompleted { step_id, .. } => Some(step_id),
            AutomationEvent::TransportExchange(exchange) => exchange.step_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this event ends its run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutomationEvent::RunCompleted { .. }
                | AutomationEvent::RunFailed { .. }
                | AutomationEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: AutomationCommand = serde_json::from_str(
            r#"{"type": "PAUSE_RUN", "runId": "run-7", "reason": "NETWORK"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            AutomationCommand::PauseRun {
                run_id: "run-7".to_string(),
                reason: PauseReason::Network,
            }
        );

        let ping: AutomationCommand = serde_json::from_str(r#"{"type": "PING"}"#).unwrap();
        assert_eq!(ping, AutomationCommand::Ping);
    }

    #[test]
    fn test_event_wire_format() {
        let event = AutomationEvent::RunCompleted {
            run_id: "run-1".to_string(),
            summary: RunSummary {
                passed_steps: 1,
                failed_steps: 0,
                total_duration_ms: 52,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RUN_COMPLETED");
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["summary"]["passedSteps"], 1);
        assert!(event.is_terminal());
        assert_eq!(event.run_id(), Some("run-1"));
    }
}
