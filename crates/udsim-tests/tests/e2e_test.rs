//! End-to-end scenario runs through the automation engine
//!
//! Run with: cargo test -p udsim-tests --test e2e_test

use std::sync::Arc;

use pretty_assertions::assert_eq;
use udsim_core::{
    AuditResult, AutomationEvent, DiagnosticStore, FailureReason, MemoryStore, MetricsEvent,
    RunScenarioCommand, RunStatus, SecurityLevel, TransportKind, UdsServiceRequest,
};
use udsim_tests::{
    collect_run, event_type, fast_config, template, CancellingAuditSink, Fixture, WAIT,
};
use udsim_uds::{codec, AutomationEngine};

fn tester_present() -> UdsServiceRequest {
    UdsServiceRequest::new(0x3E).with_sub_function(0x00)
}

// =============================================================================
// Single Step
// =============================================================================

#[tokio::test]
async fn test_extended_session_over_can_passes() {
    let fixture = Fixture::new(&fast_config());
    let mut events = fixture.engine.subscribe();

    let scenario = template(
        "engine_ecu",
        vec![UdsServiceRequest::new(0x10).with_sub_function(0x03)],
    );
    let scenario_id = scenario.id.clone();
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(scenario))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;

    let types: Vec<String> = collected.iter().map(event_type).collect();
    assert_eq!(
        types,
        vec![
            "RUN_STARTED",
            "STEP_STARTED",
            "TRANSPORT_EXCHANGE",
            "STEP_COMPLETED",
            "RUN_COMPLETED"
        ]
    );
    match collected.last() {
        Some(AutomationEvent::RunCompleted { summary, .. }) => {
            assert_eq!(summary.passed_steps, 1);
            assert_eq!(summary.failed_steps, 0);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
    match &collected[2] {
        AutomationEvent::TransportExchange(exchange) => {
            assert_eq!(exchange.transport, TransportKind::Can);
            assert_eq!(exchange.request, "1003");
            assert_eq!(exchange.response, "5003");
            assert_eq!(exchange.frames, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let audit = fixture.store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].result, AuditResult::Success);
    assert_eq!(audit[0].service_sid, 0x10);
    assert_eq!(audit[0].scenario_id.as_deref(), Some(scenario_id.as_str()));
    assert_eq!(audit[0].security_level_used, SecurityLevel::Default);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_failing_step_is_retried_then_fails_run() {
    let fixture = Fixture::new(&fast_config());
    let mut events = fixture.engine.subscribe();

    let services = vec![
        tester_present(),
        UdsServiceRequest::new(0x22).with_data(vec![0xDE, 0xAD]),
        tester_present(),
    ];
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)).with_retries(1))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;
    let run = fixture.engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason, Some(FailureReason::StepFailure));
    assert_eq!(run.failing_step_id.as_deref(), Some("step-2"));
    assert_eq!(
        run.error_message.as_deref(),
        Some("expected SUCCESS, got NRC 0x31")
    );
    assert_eq!(run.results.len(), 2);
    assert_eq!(run.results[1].attempts, 2);

    // One line per attempt plus the failure summary
    assert_eq!(run.log.len(), 4, "log: {:?}", run.log);
    assert!(run.log[3].starts_with("run failed at step-2"));

    let step2_starts = collected
        .iter()
        .filter(|e| matches!(e, AutomationEvent::StepStarted { step_id, .. } if step_id == "step-2"))
        .count();
    assert_eq!(step2_starts, 2);
    assert!(collected.iter().all(|e| e.step_id() != Some("step-3")));

    // Audit once per attempt; NRC attempts carry the code
    let audit = fixture.store.audit_entries();
    assert_eq!(audit.len(), 3);
    assert_eq!(audit[1].result, AuditResult::Nrc);
    assert_eq!(audit[1].nrc_code, Some(0x31));

    // The terminal run is persisted as reported
    let stored = fixture.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored, run);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_after_second_step_stops_run() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CancellingAuditSink::new(store.clone(), 2));
    let fixture = Fixture::with_audit(&fast_config(), sink.clone(), store);
    sink.attach(fixture.engine.clone());
    let mut events = fixture.engine.subscribe();

    let services = (0..5).map(|_| tester_present()).collect();
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;
    let run = fixture.engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.results.len(), 2);
    assert!(run.finished_at.is_some());
    assert_eq!(fixture.store.audit_entries().len(), 2);

    for step in ["step-3", "step-4", "step-5"] {
        assert!(
            collected.iter().all(|e| e.step_id() != Some(step)),
            "{} must not start",
            step
        );
    }
    assert_eq!(
        collected.last(),
        Some(&AutomationEvent::RunCancelled {
            run_id: run_id.clone(),
            reason: "operator abort".to_string(),
        })
    );
}

// =============================================================================
// Security Access
// =============================================================================

#[tokio::test]
async fn test_handshake_unlocks_write_over_doip() {
    let fixture = Fixture::new(&fast_config());
    let mut events = fixture.engine.subscribe();

    let services = vec![
        UdsServiceRequest::new(0x10).with_sub_function(0x03),
        UdsServiceRequest::new(0x27).with_sub_function(0x01),
        // Key is derived from the seed of the previous step
        UdsServiceRequest::new(0x27).with_sub_function(0x02),
        UdsServiceRequest::new(0x2E)
            .with_data(vec![0xF1, 0x90, 0x42])
            .with_transport(TransportKind::DoIp)
            .with_security_level(SecurityLevel::Supplier),
    ];
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;
    let run = fixture.engine.wait_for_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed, "log: {:?}", run.log);

    let doip = collected
        .iter()
        .find_map(|e| match e {
            AutomationEvent::TransportExchange(x) if x.step_id.as_deref() == Some("step-4") => {
                Some(x.clone())
            }
            _ => None,
        })
        .expect("write exchange reported");
    assert_eq!(doip.transport, TransportKind::DoIp);
    assert_eq!(doip.overhead_bytes, 12);
    assert_eq!(doip.response, "6EF19042");

    let levels: Vec<SecurityLevel> = fixture
        .store
        .audit_entries()
        .iter()
        .map(|a| a.security_level_used)
        .collect();
    assert_eq!(
        levels,
        vec![
            SecurityLevel::Default,
            SecurityLevel::Default,
            SecurityLevel::Default,
            SecurityLevel::Supplier
        ]
    );
}

#[tokio::test]
async fn test_three_invalid_keys_lock_security_access() {
    let fixture = Fixture::new(&fast_config());

    let bad_key = || {
        UdsServiceRequest::new(0x27)
            .with_sub_function(0x02)
            .with_data(vec![0x00, 0x00])
    };
    let services = vec![
        UdsServiceRequest::new(0x27).with_sub_function(0x01),
        bad_key().expecting_nrc(0x35),
        bad_key().expecting_nrc(0x35),
        bad_key().expecting_nrc(0x36),
        // Seed was discarded by the lockout
        UdsServiceRequest::new(0x27)
            .with_sub_function(0x02)
            .expecting_nrc(0x24),
    ];
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)))
        .await
        .unwrap();
    let run = fixture.engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Passed, "log: {:?}", run.log);
    let nrcs: Vec<Option<u8>> = fixture
        .store
        .audit_entries()
        .iter()
        .map(|a| a.nrc_code)
        .collect();
    assert_eq!(nrcs, vec![None, Some(0x35), Some(0x35), Some(0x36), Some(0x24)]);
}

#[tokio::test]
async fn test_protected_service_without_handshake_is_denied() {
    let fixture = Fixture::new(&fast_config());
    let mut events = fixture.engine.subscribe();

    let services = vec![UdsServiceRequest::new(0x31)
        .with_sub_function(0x01)
        .with_data(vec![0xFF, 0x00])
        .with_security_level(SecurityLevel::Oem)];
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)).with_retries(2))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;

    assert!(collected
        .iter()
        .all(|e| !matches!(e, AutomationEvent::TransportExchange(_))));
    match collected.last() {
        Some(AutomationEvent::RunFailed {
            failing_step_id,
            reason,
            error_message,
            ..
        }) => {
            assert_eq!(failing_step_id.as_deref(), Some("step-1"));
            assert_eq!(*reason, FailureReason::SecurityAccessDenied);
            assert!(error_message.contains("oem"), "{}", error_message);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }

    let audit = fixture.store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].result, AuditResult::Error);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_runs_on_different_ecus_proceed_concurrently() {
    let fixture = Fixture::new(&fast_config());

    let mut run_ids = Vec::new();
    for ecu in ["engine_ecu", "body_ecu", "brake_ecu"] {
        let services = vec![
            UdsServiceRequest::new(0x10).with_sub_function(0x03),
            UdsServiceRequest::new(0x27).with_sub_function(0x01),
            UdsServiceRequest::new(0x27).with_sub_function(0x02),
        ];
        let run_id = fixture
            .engine
            .run_scenario(RunScenarioCommand::new(template(ecu, services)))
            .await
            .unwrap();
        run_ids.push(run_id);
    }

    for run_id in &run_ids {
        let run = tokio::time::timeout(WAIT, fixture.engine.wait_for_run(run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Passed, "log: {:?}", run.log);
    }
    assert_eq!(fixture.store.audit_entries().len(), 9);

    let template_runs = fixture
        .store
        .metrics_events()
        .iter()
        .filter(|m| matches!(m, MetricsEvent::TemplateRun { .. }))
        .count();
    assert_eq!(template_runs, 3);
}

#[tokio::test]
async fn test_concurrent_handshakes_on_one_ecu_do_not_interleave() {
    let mut config = fast_config();
    config.transport.can.latency_ms = 10;
    let fixture = Fixture::new(&config);

    let handshake = || {
        vec![
            UdsServiceRequest::new(0x27).with_sub_function(0x01),
            UdsServiceRequest::new(0x27).with_sub_function(0x02),
        ]
    };
    let first = template("engine_ecu", handshake());
    let second = template("engine_ecu", handshake());
    let scenario_ids = [first.id.clone(), second.id.clone()];

    let mut run_ids = Vec::new();
    for scenario in [first, second] {
        let run_id = fixture
            .engine
            .run_scenario(RunScenarioCommand::new(scenario))
            .await
            .unwrap();
        run_ids.push(run_id);
    }

    for run_id in &run_ids {
        let run = tokio::time::timeout(WAIT, fixture.engine.wait_for_run(run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Passed, "log: {:?}", run.log);
        assert!(run.results.iter().all(|r| r.attempts == 1));
    }

    // Each seed is answered by its own run's key before the other run asks
    let audit = fixture.store.audit_entries();
    assert!(audit.iter().all(|a| a.result == AuditResult::Success));
    let order: Vec<&str> = audit
        .iter()
        .filter_map(|a| a.scenario_id.as_deref())
        .collect();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], order[1]);
    assert_eq!(order[2], order[3]);
    assert_ne!(order[0], order[2]);
    assert!(scenario_ids.iter().all(|id| order.contains(&id.as_str())));
}

// =============================================================================
// Large Transfers
// =============================================================================

#[tokio::test]
async fn test_transfer_beyond_classic_iso_tp_length_passes() {
    let fixture = Fixture::new(&fast_config());
    let mut events = fixture.engine.subscribe();

    // Block counter plus 4095 data bytes, 4097 bytes on the wire
    let mut block = vec![0x01];
    block.extend(std::iter::repeat(0x00).take(4095));
    let services = vec![UdsServiceRequest::new(0x36).with_data(block)];
    let run_id = fixture
        .engine
        .run_scenario(RunScenarioCommand::new(template("engine_ecu", services)).with_retries(2))
        .await
        .unwrap();
    let collected = collect_run(&mut events, &run_id).await;
    let run = fixture.engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Passed, "log: {:?}", run.log);
    assert_eq!(run.results[0].attempts, 1);
    let frames = collected.iter().find_map(|e| match e {
        AutomationEvent::TransportExchange(x) => Some(x.frames),
        _ => None,
    });
    assert_eq!(frames, Some(586));
}

// =============================================================================
// Ad-hoc Requests
// =============================================================================

#[tokio::test]
async fn test_ad_hoc_request_is_audited_without_scenario() {
    let store = Arc::new(MemoryStore::new());
    let engine = AutomationEngine::from_config(&fast_config(), store.clone(), store.clone())
        .unwrap();

    let request = UdsServiceRequest::new(0x22).with_data(vec![0xF1, 0x90]);
    let exchange = tokio_test::assert_ok!(engine.tester().execute("engine_ecu", &request).await);
    assert!(exchange.response.is_positive);
    assert_eq!(exchange.response.data, vec![0xF1, 0x90, 0x57, 0x44, 0x42]);

    let audit = store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].scenario_id, None);
    assert!(matches!(
        store.metrics_events().as_slice(),
        [MetricsEvent::ServiceUsed { sid: 0x22, .. }]
    ));
}

// =============================================================================
// Codec
// =============================================================================

#[test]
fn test_codec_wire_format() {
    let request = UdsServiceRequest::new(0x27)
        .with_sub_function(0x02)
        .with_data(vec![0xAA, 0xBB]);
    assert_eq!(codec::encode(&request), vec![0x27, 0x02, 0xAA, 0xBB]);

    let positive = codec::decode(&[0x67, 0x02]).unwrap();
    assert!(positive.is_positive);
    assert_eq!(positive.sid, 0x27);

    let negative = codec::decode(&[0x7F, 0x27, 0x35]).unwrap();
    assert!(!negative.is_positive);
    assert_eq!(negative.nrc, Some(0x35));

    assert!(codec::decode(&[]).is_err());
    assert!(codec::decode(&[0x7F, 0x27]).is_err());
}
