//! Automation run model and its state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DiagnosticScenarioTemplate, UdsServiceRequest, UdsServiceResponse};
use crate::error::{EngineError, EngineResult};

/// Status of an automation run
///
/// `queued` is the only initial state; `passed`, `failed` and `cancelled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the run state machine
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (*self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Passed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Expected classification of a step's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Success,
    Nrc,
}

/// Why a run was paused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    #[default]
    User,
    Security,
    Network,
}

/// Why a run ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// A step failed after exhausting its retries
    StepFailure,
    /// A step required a higher security level than the ECU session held
    SecurityAccessDenied,
    /// The run exceeded its timeout
    Timeout,
}

/// A check applied to a step's decoded response
///
/// Paths address the JSON view of the response: `sid`, `isPositive`, `nrc`,
/// `data` and `data.N` / `data[N]` for individual bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssertionDescriptor {
    /// Deep equality of the value at `path`
    Equal {
        path: String,
        #[serde(rename = "expectedValue")]
        expected_value: serde_json::Value,
    },
    /// Numeric value at `path` within `[min, max]`
    Range { path: String, min: f64, max: f64 },
    /// Response must be negative with exactly this NRC
    Nrc {
        #[serde(rename = "expectedValue")]
        expected_value: u8,
    },
}

impl AssertionDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            AssertionDescriptor::Equal { .. } => "equal",
            AssertionDescriptor::Range { .. } => "range",
            AssertionDescriptor::Nrc { .. } => "nrc",
        }
    }
}

/// One step of an automated run; read-only once the run starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedTestStep {
    pub step_id: String,
    pub request: UdsServiceRequest,
    pub expected_outcome: StepOutcome,
    #[serde(default)]
    pub assertions: Vec<AssertionDescriptor>,
}

impl AutomatedTestStep {
    /// Step whose expected outcome follows the request's expected NRC set
    pub fn from_request(step_id: impl Into<String>, request: UdsServiceRequest) -> Self {
        let expected_outcome = if request.expected_nrc.is_empty() {
            StepOutcome::Success
        } else {
            StepOutcome::Nrc
        };
        Self {
            step_id: step_id.into(),
            request,
            expected_outcome,
            assertions: Vec::new(),
        }
    }

    pub fn with_assertion(mut self, assertion: AssertionDescriptor) -> Self {
        self.assertions.push(assertion);
        self
    }

    /// One step per service of a template, ids `step-1`, `step-2`, ...
    pub fn from_template(template: &DiagnosticScenarioTemplate) -> Vec<Self> {
        template
            .services
            .iter()
            .enumerate()
            .map(|(i, request)| Self::from_request(format!("step-{}", i + 1), request.clone()))
            .collect()
    }
}

/// Final record of one executed step (all attempts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub attempts: u32,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<UdsServiceResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration of all attempts together
    pub duration_ms: u64,
}

/// Summary counts of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub passed_steps: u32,
    pub failed_steps: u32,
    pub total_duration_ms: u64,
}

/// An automation run
///
/// Status only moves along [`RunStatus::can_transition_to`] edges and
/// `finished_at` is written exactly once, by the transition into a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedTestRun {
    pub id: String,
    pub scenario_id: String,
    pub target_ecu_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<AutomatedTestStep>,
    pub log: Vec<String>,
    /// Retries per failing step
    pub retries: u32,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl AutomatedTestRun {
    pub fn new(
        id: impl Into<String>,
        scenario_id: impl Into<String>,
        target_ecu_id: impl Into<String>,
        steps: Vec<AutomatedTestStep>,
        retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            scenario_id: scenario_id.into(),
            target_ecu_id: target_ecu_id.into(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            steps,
            log: Vec::new(),
            retries,
            results: Vec::new(),
            failing_step_id: None,
            error_message: None,
            failure_reason: None,
            summary: None,
        }
    }

    /// Move to `to`, stamping `started_at` / `finished_at` as needed
    pub fn transition(&mut self, to: RunStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if to == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Summary counts over the recorded step results
    pub fn compute_summary(&self) -> RunSummary {
        let passed_steps = self.results.iter().filter(|r| r.passed).count() as u32;
        RunSummary {
            passed_steps,
            failed_steps: self.results.len() as u32 - passed_steps,
            total_duration_ms: self.results.iter().map(|r| r.duration_ms).sum(),
        }
    }
}
