//! Run task: executes one run's steps strictly in order

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, info, warn};
use udsim_core::{
    AssertionFailure, AutomatedTestStep, AutomationEvent, EngineError, FailureReason,
    RunStatus, SecurityError, StepOutcome, StepResult, UdsServiceRequest,
};

use super::assertion::evaluate_all;
use super::engine::EngineShared;
use super::run::{Control, RunHandle};
use crate::security::compute_key;
use crate::tester::{audit_entry, AuditContext, Exchange, ExchangeError};
use crate::transport::TransportError;
use crate::uds::{codec, security_sub_function, service_id};

/// How a run ended
#[derive(Debug)]
enum RunEnd {
    Passed,
    Failed {
        step_id: String,
        message: String,
        reason: FailureReason,
    },
    TimedOut,
    Cancelled(String),
}

/// Why a step attempt failed
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("expected {}, got {actual}", outcome_label(.expected))]
    OutcomeMismatch {
        expected: StepOutcome,
        actual: String,
        sid: u8,
    },

    #[error("{}", join_failures(.0))]
    Assertions(Vec<AssertionFailure>),
}

impl StepError {
    /// Transport and execution failures are retried; security, audit and
    /// deadline failures never are
    fn is_retryable(&self) -> bool {
        match self {
            StepError::Exchange(ExchangeError::Security(_))
            | StepError::Exchange(ExchangeError::Audit(_))
            | StepError::Exchange(ExchangeError::Transport(TransportError::Timeout(_))) => false,
            StepError::Exchange(_) => true,
            StepError::OutcomeMismatch { sid, .. } => *sid != service_id::SECURITY_ACCESS,
            StepError::Assertions(_) => true,
        }
    }

    fn failure_reason(&self) -> FailureReason {
        match self {
            StepError::Exchange(ExchangeError::Security(SecurityError::AccessDenied { .. })) => {
                FailureReason::SecurityAccessDenied
            }
            _ => FailureReason::StepFailure,
        }
    }
}

fn outcome_label(outcome: &StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Success => "SUCCESS",
        StepOutcome::Nrc => "NRC",
    }
}

fn join_failures(failures: &[AssertionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check an exchange result against the step's expectations
fn judge(
    step: &AutomatedTestStep,
    request: &UdsServiceRequest,
    result: &Result<Exchange, ExchangeError>,
) -> Result<(), StepError> {
    let exchange = result.as_ref().map_err(|e| StepError::Exchange(e.clone()))?;
    let response = &exchange.response;

    let actual = if response.is_positive {
        StepOutcome::Success
    } else {
        StepOutcome::Nrc
    };
    let describe = || match response.nrc {
        Some(nrc) if !response.is_positive => format!("NRC 0x{:02X}", nrc),
        _ => "SUCCESS".to_string(),
    };

    if actual != step.expected_outcome {
        return Err(StepError::OutcomeMismatch {
            expected: step.expected_outcome,
            actual: describe(),
            sid: request.sid,
        });
    }
    if actual == StepOutcome::Nrc
        && !request.expected_nrc.is_empty()
        && !codec::matches_expected_nrc(response, &request.expected_nrc)
    {
        return Err(StepError::OutcomeMismatch {
            expected: step.expected_outcome,
            actual: format!("{} (expected one of {:02X?})", describe(), request.expected_nrc),
            sid: request.sid,
        });
    }

    let failures = evaluate_all(&step.assertions, response);
    if !failures.is_empty() {
        return Err(StepError::Assertions(failures));
    }
    Ok(())
}

/// Fill in the key of a send-key request authored without data
fn prepare_request(request: &UdsServiceRequest, last_seed: Option<&[u8]>) -> UdsServiceRequest {
    let mut request = request.clone();
    if request.sid == service_id::SECURITY_ACCESS && request.data.is_empty() {
        if let (Some(sub_function), Some(seed)) = (request.sub_function, last_seed) {
            if !security_sub_function::is_request_seed(sub_function) {
                request.data = compute_key(seed);
            }
        }
    }
    request
}

fn is_seed_request(request: &UdsServiceRequest) -> bool {
    request.sid == service_id::SECURITY_ACCESS
        && request
            .sub_function
            .is_some_and(security_sub_function::is_request_seed)
}

fn is_key_send(request: &UdsServiceRequest) -> bool {
    request.sid == service_id::SECURITY_ACCESS
        && request
            .sub_function
            .is_some_and(|sub| !security_sub_function::is_request_seed(sub))
}

/// Seed carried by a positive request-seed response
fn issued_seed(request: &UdsServiceRequest, exchange: &Exchange) -> Option<Vec<u8>> {
    let data = &exchange.response.data;
    (is_seed_request(request) && exchange.response.is_positive && data.len() > 1)
        .then(|| data[1..].to_vec())
}

pub(crate) struct RunTask {
    shared: Arc<EngineShared>,
    handle: Arc<RunHandle>,
    control: watch::Receiver<Control>,
    run_id: String,
    scenario_id: String,
    ecu_id: String,
    current_step: Option<String>,
    /// Held from a seed request until its key step settles
    handshake: Option<OwnedMutexGuard<()>>,
    deadline: tokio::time::Instant,
}

impl RunTask {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        handle: Arc<RunHandle>,
        control: watch::Receiver<Control>,
    ) -> Self {
        let (run_id, scenario_id, ecu_id) = {
            let run = handle.state.lock();
            (
                run.id.clone(),
                run.scenario_id.clone(),
                run.target_ecu_id.clone(),
            )
        };
        let deadline = tokio::time::Instant::now() + handle.timeout;
        Self {
            shared,
            handle,
            control,
            run_id,
            scenario_id,
            ecu_id,
            current_step: None,
            handshake: None,
            deadline,
        }
    }

    pub(crate) async fn run(mut self) {
        let admission = self.shared.admission.clone();
        let _permit = tokio::select! {
            permit = admission.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(run_id = %self.run_id, "Engine stopped before run was admitted");
                    return;
                }
            },
            reason = wait_for_cancel(&mut self.control) => {
                self.finish(RunEnd::Cancelled(reason)).await;
                return;
            }
        };

        {
            let mut run = self.handle.state.lock();
            if let Err(e) = run.transition(RunStatus::Running) {
                warn!(run_id = %self.run_id, error = %e, "Run could not start");
                return;
            }
            info!(run_id = %self.run_id, scenario_id = %self.scenario_id, "Run started");
            self.shared.emit(AutomationEvent::RunStarted {
                run_id: self.run_id.clone(),
                scenario_id: self.scenario_id.clone(),
                total_steps: run.steps.len(),
                started_at: run.started_at.unwrap_or_else(chrono::Utc::now),
            });
        }

        // The timeout counts from admission
        self.deadline = tokio::time::Instant::now() + self.handle.timeout;
        let end = self.execute().await;
        self.handshake = None;
        self.finish(end).await;
    }

    async fn execute(&mut self) -> RunEnd {
        let steps = self.handle.state.lock().steps.clone();
        let mut last_seed: Option<Vec<u8>> = None;

        for step in &steps {
            self.current_step = Some(step.step_id.clone());
            if let Some(end) = self.checkpoint().await {
                return end;
            }
            if let Err(end) = self.run_step(step, &mut last_seed).await {
                return end;
            }
        }

        // A pause requested during the last step still holds the run open
        if let Some(end) = self.checkpoint().await {
            return end;
        }
        RunEnd::Passed
    }

    async fn run_step(
        &mut self,
        step: &AutomatedTestStep,
        last_seed: &mut Option<Vec<u8>>,
    ) -> Result<(), RunEnd> {
        let max_attempts = self.handle.state.lock().retries + 1;
        let request = prepare_request(&step.request, last_seed.as_deref());
        let tester = self.shared.tester.clone();
        if is_seed_request(&request) && self.handshake.is_none() {
            self.acquire_handshake().await?;
        }

        let mut attempts = 0;
        let mut total_ms = 0;
        let mut timed_out = false;
        let mut failure: Option<(StepError, Option<Exchange>)> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                if let Some(end) = self.checkpoint().await {
                    return Err(end);
                }
                debug!(run_id = %self.run_id, step_id = %step.step_id, attempt, "Retrying step");
            }
            attempts = attempt;

            self.shared.emit(AutomationEvent::StepStarted {
                run_id: self.run_id.clone(),
                step_id: step.step_id.clone(),
                attempt,
            });

            let security_level = tester.security().current_level(&self.ecu_id);
            let leased = self.handshake.is_some();
            let started = Instant::now();
            let (result, expired) = tokio::select! {
                biased;
                result = async {
                    if leased {
                        tester.exchange_leased(&self.ecu_id, &request).await
                    } else {
                        tester.exchange(&self.ecu_id, &request).await
                    }
                } => (result, false),
                _ = tokio::time::sleep_until(self.deadline) => {
                    let detail = format!(
                        "no response within the {} ms run timeout",
                        self.handle.timeout.as_millis()
                    );
                    (Err(ExchangeError::from(TransportError::Timeout(detail))), true)
                }
            };
            timed_out = expired;
            let duration_ms = started.elapsed().as_millis() as u64;
            total_ms += duration_ms;

            let context = AuditContext {
                ecu_id: &self.ecu_id,
                scenario_id: Some(&self.scenario_id),
                user_persona: &self.handle.user_persona,
                security_level,
            };
            let audited = tester
                .record_audit(audit_entry(&context, &request, &result, duration_ms))
                .await;
            tester.emit_service_used(&self.ecu_id, &request);

            let verdict = match audited {
                Ok(()) => judge(step, &request, &result),
                Err(e) => Err(StepError::Exchange(ExchangeError::Audit(e))),
            };
            if let Ok(exchange) = &result {
                if let Some(seed) = issued_seed(&request, exchange) {
                    *last_seed = Some(seed);
                }
            }

            let error = verdict.as_ref().err().map(ToString::to_string);
            {
                let mut run = self.handle.state.lock();
                run.log.push(match &error {
                    None => format!(
                        "{} attempt {}/{}: passed ({} ms)",
                        step.step_id, attempt, max_attempts, duration_ms
                    ),
                    Some(error) => format!(
                        "{} attempt {}/{}: failed: {}",
                        step.step_id, attempt, max_attempts, error
                    ),
                });
            }
            if let Ok(exchange) = &result {
                self.shared.emit(AutomationEvent::TransportExchange(exchange.to_record(
                    &self.ecu_id,
                    Some(&self.run_id),
                    Some(&step.step_id),
                )));
            }
            self.shared.emit(AutomationEvent::StepCompleted {
                run_id: self.run_id.clone(),
                step_id: step.step_id.clone(),
                attempt,
                passed: verdict.is_ok(),
                response: result.as_ref().ok().map(|e| e.response.clone()),
                error: error.clone(),
                duration_ms,
            });

            match verdict {
                Ok(()) => {
                    info!(
                        run_id = %self.run_id,
                        step_id = %step.step_id,
                        attempt,
                        duration_ms,
                        "Step passed"
                    );
                    self.handle.state.lock().results.push(StepResult {
                        step_id: step.step_id.clone(),
                        attempts,
                        passed: true,
                        response: result.ok().map(|e| e.response),
                        error: None,
                        duration_ms: total_ms,
                    });
                    if is_key_send(&request) {
                        self.handshake = None;
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        run_id = %self.run_id,
                        step_id = %step.step_id,
                        attempt,
                        error = %err,
                        "Step failed"
                    );
                    let retryable = err.is_retryable();
                    failure = Some((err, result.ok()));
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let (err, exchange) = match failure {
            Some(failure) => failure,
            None => {
                return Err(RunEnd::Failed {
                    step_id: step.step_id.clone(),
                    message: "step was not executed".to_string(),
                    reason: FailureReason::StepFailure,
                })
            }
        };
        let message = err.to_string();
        self.handle.state.lock().results.push(StepResult {
            step_id: step.step_id.clone(),
            attempts,
            passed: false,
            response: exchange.map(|e| e.response),
            error: Some(message.clone()),
            duration_ms: total_ms,
        });

        if timed_out {
            return Err(RunEnd::TimedOut);
        }
        Err(RunEnd::Failed {
            step_id: step.step_id.clone(),
            message,
            reason: err.failure_reason(),
        })
    }

    /// Wait for the ECU's handshake lease
    async fn acquire_handshake(&mut self) -> Result<(), RunEnd> {
        let security = self.shared.tester.security().clone();
        let lease = tokio::select! {
            biased;
            reason = wait_for_cancel(&mut self.control) => Err(RunEnd::Cancelled(reason)),
            _ = tokio::time::sleep_until(self.deadline) => Err(RunEnd::TimedOut),
            lease = security.lock_ecu(&self.ecu_id) => Ok(lease),
        }?;
        debug!(run_id = %self.run_id, ecu_id = %self.ecu_id, "Handshake lease acquired");
        self.handshake = Some(lease);
        Ok(())
    }

    /// Apply pending control; returns how the run ends if it was cancelled
    /// or its deadline passed
    async fn checkpoint(&mut self) -> Option<RunEnd> {
        loop {
            if tokio::time::Instant::now() >= self.deadline {
                return Some(RunEnd::TimedOut);
            }
            let control = self.control.borrow_and_update().clone();
            match control {
                Control::Run => {
                    self.set_running();
                    return None;
                }
                Control::Cancel(reason) => return Some(RunEnd::Cancelled(reason)),
                Control::Pause(reason) => {
                    {
                        let mut run = self.handle.state.lock();
                        if run.status == RunStatus::Running
                            && run.transition(RunStatus::Paused).is_ok()
                        {
                            run.log.push(format!("paused ({:?})", reason));
                            info!(run_id = %self.run_id, ?reason, "Run paused");
                            self.shared.emit(AutomationEvent::RunPaused {
                                run_id: self.run_id.clone(),
                                reason,
                            });
                        }
                    }
                    tokio::select! {
                        changed = self.control.changed() => if changed.is_err() {
                            return Some(RunEnd::Cancelled("engine stopped".to_string()));
                        },
                        _ = tokio::time::sleep_until(self.deadline) => return Some(RunEnd::TimedOut),
                    }
                }
            }
        }
    }

    fn set_running(&self) {
        let mut run = self.handle.state.lock();
        if run.status == RunStatus::Paused && run.transition(RunStatus::Running).is_ok() {
            run.log.push("resumed".to_string());
            info!(run_id = %self.run_id, "Run resumed");
            self.shared.emit(AutomationEvent::RunResumed {
                run_id: self.run_id.clone(),
            });
        }
    }

    async fn finish(&self, end: RunEnd) {
        let snapshot = {
            let mut run = self.handle.state.lock();
            let target = match end {
                RunEnd::Passed => RunStatus::Passed,
                RunEnd::Failed { .. } | RunEnd::TimedOut => RunStatus::Failed,
                RunEnd::Cancelled(_) => RunStatus::Cancelled,
            };
            if let Err(e) = run.transition(target) {
                warn!(run_id = %self.run_id, error = %e, "Run could not finish");
                return;
            }

            let summary = run.compute_summary();
            run.summary = Some(summary);

            let event = match end {
                RunEnd::Passed => {
                    let total_steps = run.steps.len();
                    run.log.push(format!(
                        "run passed: {}/{} steps in {} ms",
                        summary.passed_steps, total_steps, summary.total_duration_ms
                    ));
                    info!(run_id = %self.run_id, passed_steps = summary.passed_steps, "Run passed");
                    AutomationEvent::RunCompleted {
                        run_id: self.run_id.clone(),
                        summary,
                    }
                }
                RunEnd::Failed {
                    step_id,
                    message,
                    reason,
                } => self.fail(&mut run, Some(step_id), message, reason),
                RunEnd::TimedOut => {
                    let message = EngineError::Timeout {
                        timeout_ms: self.handle.timeout.as_millis() as u64,
                    }
                    .to_string();
                    self.fail(
                        &mut run,
                        self.current_step.clone(),
                        message,
                        FailureReason::Timeout,
                    )
                }
                RunEnd::Cancelled(reason) => {
                    run.log.push(format!("run cancelled: {}", reason));
                    info!(run_id = %self.run_id, %reason, "Run cancelled");
                    AutomationEvent::RunCancelled {
                        run_id: self.run_id.clone(),
                        reason,
                    }
                }
            };
            self.shared.emit(event);
            run.clone()
        };

        if let Some(store) = &self.shared.store {
            if let Err(e) = store.save_run(snapshot).await {
                warn!(run_id = %self.run_id, error = %e, "Failed to persist run");
            }
        }
    }

    fn fail(
        &self,
        run: &mut udsim_core::AutomatedTestRun,
        step_id: Option<String>,
        message: String,
        reason: FailureReason,
    ) -> AutomationEvent {
        match &step_id {
            Some(step_id) => run.log.push(format!("run failed at {}: {}", step_id, message)),
            None => run.log.push(format!("run failed: {}", message)),
        }
        warn!(run_id = %self.run_id, ?reason, error = %message, "Run failed");

        run.failing_step_id = step_id.clone();
        run.error_message = Some(message.clone());
        run.failure_reason = Some(reason);
        AutomationEvent::RunFailed {
            run_id: self.run_id.clone(),
            failing_step_id: step_id,
            error_message: message,
            reason,
            summary: run.summary.unwrap_or_default(),
        }
    }
}

/// Resolve once cancellation is requested
async fn wait_for_cancel(control: &mut watch::Receiver<Control>) -> String {
    loop {
        if let Control::Cancel(reason) = &*control.borrow_and_update() {
            return reason.clone();
        }
        if control.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
