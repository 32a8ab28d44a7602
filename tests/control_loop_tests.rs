//! Control loop tests: scheduler, evaluator and backpressure working together
//!
//! All tests run on paused tokio time, so tick and timer ordering is exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use chaos_gate::Error;
use chaos_gate::slo::GateSeverity;
use chaos_gate::state::BackpressureState;
use chaos_gate::telemetry::names;

use common::{FakeApplier, Harness, RecordingLoadGenerator, ScriptedMetrics, config, fault, gate};

async fn advance_to(secs: u64, start: tokio::time::Instant) {
    tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
}

/// One fault, one trigger gate: injection, backpressure and expiry
#[tokio::test(start_paused = true)]
async fn test_cpu_fault_with_critical_violation() {
    let start = tokio::time::Instant::now();
    let config = config(
        vec![fault("cpu", 1.0, 5)],
        vec![gate("p95-latency", "response_time_p95", GateSeverity::Critical, true)],
    );
    let applier = FakeApplier::new();
    let load = RecordingLoadGenerator::new();
    let metrics = ScriptedMetrics::new().with("response_time_p95", [Some(0.9)], Some(0.1));
    let h = Harness::new(&config, applier.clone(), metrics, load.clone());
    let ctx = h.ctx.clone();

    h.ctx.tracker.spawn(h.scheduler.run());
    h.ctx.tracker.spawn(h.evaluator.run());

    advance_to(1, start).await;
    {
        let state = ctx.state.lock();
        assert!(state.registry.is_active("cpu"));
        assert_eq!(state.backpressure, BackpressureState::Active);
        assert_eq!(state.health.value(), 80.0);
        assert_eq!(state.violations.len(), 1);
    }
    assert_eq!(load.reduces(), 1);

    advance_to(6, start).await;
    {
        let state = ctx.state.lock();
        assert!(!state.registry.is_active("cpu"));
        assert_eq!(state.backpressure, BackpressureState::Active);
    }
    assert_eq!(applier.reverts(), 1);
    assert_eq!(
        applier.events(),
        vec![("apply", "cpu".to_string()), ("revert", "cpu".to_string())]
    );

    ctx.token.cancel();
    ctx.tracker.close();
    ctx.tracker.wait().await;
}

/// Two trigger gates failing in the same tick engage backpressure once
#[tokio::test(start_paused = true)]
async fn test_two_gates_trip_in_one_tick() {
    let config = config(
        vec![],
        vec![
            gate("p95-latency", "response_time_p95", GateSeverity::Critical, true),
            gate("errors", "error_rate", GateSeverity::Warning, true),
        ],
    );
    let load = RecordingLoadGenerator::new();
    let metrics = ScriptedMetrics::new()
        .constant("response_time_p95", 0.9)
        .constant("error_rate", 0.8);
    let h = Harness::new(&config, FakeApplier::new(), metrics, load.clone());

    let report = h.evaluator.tick().await;
    assert_eq!(report.violated, 2);

    let state = h.ctx.state.lock();
    assert_eq!(state.violations.len(), 2);
    assert_eq!(state.backpressure, BackpressureState::Active);
    assert_eq!(state.backpressure_activations, 1);
    assert_eq!(state.health.value(), 75.0);
    drop(state);

    assert_eq!(load.reduces(), 1);
    assert_eq!(h.sink.count_with(names::BACKPRESSURE_ACTIVATIONS, "action", "activate"), 1);
    assert_eq!(h.sink.count(names::SLO_VIOLATIONS), 2);
}

/// Missing data for three ticks records nothing
#[tokio::test(start_paused = true)]
async fn test_metrics_unavailable_for_three_ticks() {
    let config = config(
        vec![],
        vec![
            gate("p95-latency", "response_time_p95", GateSeverity::Critical, true),
            gate("errors", "error_rate", GateSeverity::Critical, false),
        ],
    );
    let load = RecordingLoadGenerator::new();
    let h = Harness::new(&config, FakeApplier::new(), ScriptedMetrics::new(), load.clone());

    for _ in 0..3 {
        let report = h.evaluator.tick().await;
        assert_eq!(report.unavailable, 2);
        assert_eq!(report.violated, 0);
    }

    let state = h.ctx.state.lock();
    assert!(state.violations.is_empty());
    assert_eq!(state.health.value(), 100.0);
    assert_eq!(state.backpressure, BackpressureState::Normal);
    drop(state);

    assert_eq!(load.reduces(), 0);
    assert_eq!(h.sink.count(names::METRIC_QUERY_FAILURES), 6);
}

/// Released on the first check after a full clean lookback window, not before
#[tokio::test(start_paused = true)]
async fn test_stabilization_after_full_lookback() {
    let start = tokio::time::Instant::now();
    let config = config(
        vec![],
        vec![gate("p95-latency", "response_time_p95", GateSeverity::Critical, true)],
    );
    let load = RecordingLoadGenerator::new();
    let metrics = ScriptedMetrics::new().with("response_time_p95", [Some(0.9)], Some(0.1));
    let h = Harness::new(&config, FakeApplier::new(), metrics, load.clone());
    let ctx = h.ctx.clone();
    let backpressure = h.backpressure.clone();

    h.ctx.tracker.spawn(h.evaluator.run());

    advance_to(299, start).await;
    assert_eq!(backpressure.state(), BackpressureState::Active);
    assert_eq!(load.resumes(), 0);

    advance_to(301, start).await;
    assert_eq!(backpressure.state(), BackpressureState::Normal);
    assert_eq!(load.resumes(), 1);

    ctx.token.cancel();
    ctx.tracker.close();
    ctx.tracker.wait().await;
}

/// Repeated violations while active send one reduce and one resume
#[tokio::test(start_paused = true)]
async fn test_backpressure_signals_are_idempotent() {
    let start = tokio::time::Instant::now();
    let config = config(
        vec![],
        vec![gate("p95-latency", "response_time_p95", GateSeverity::Warning, true)],
    );
    let load = RecordingLoadGenerator::new();
    // Violating at t = 0, 10, ..., 100 s
    let metrics = ScriptedMetrics::new().with("response_time_p95", [Some(0.9); 11], Some(0.1));
    let h = Harness::new(&config, FakeApplier::new(), metrics, load.clone());
    let ctx = h.ctx.clone();

    h.ctx.tracker.spawn(h.evaluator.run());

    advance_to(105, start).await;
    assert_eq!(ctx.state.lock().violations.len(), 11);
    assert_eq!(load.reduces(), 1);

    // Last violation at 100 s; checks at 360 s (260 s old) and 420 s (320 s old).
    advance_to(419, start).await;
    assert_eq!(ctx.state.lock().backpressure, BackpressureState::Active);

    advance_to(500, start).await;
    {
        let state = ctx.state.lock();
        assert_eq!(state.backpressure, BackpressureState::Normal);
        assert_eq!(state.backpressure_activations, 1);
        assert_eq!(state.health.value(), 45.0);
    }
    assert_eq!(load.reduces(), 1);
    assert_eq!(load.resumes(), 1);

    ctx.token.cancel();
    ctx.tracker.close();
    ctx.tracker.wait().await;
}

/// A slow resume is not overtaken by the reduce of the next episode
#[tokio::test(start_paused = true)]
async fn test_slow_resume_keeps_signal_order() {
    let start = tokio::time::Instant::now();
    let config = config(
        vec![],
        vec![gate("p95-latency", "response_time_p95", GateSeverity::Warning, true)],
    );
    let load = RecordingLoadGenerator::slow_resume(Duration::from_secs(20));
    // Violating at 0 s, clean from 10 s to 300 s, violating again at 310 s.
    let mut samples = vec![Some(0.9)];
    samples.extend([Some(0.1); 30]);
    samples.push(Some(0.9));
    let metrics = ScriptedMetrics::new().with("response_time_p95", samples, Some(0.1));
    let h = Harness::new(&config, FakeApplier::new(), metrics, load.clone());
    let ctx = h.ctx.clone();

    h.ctx.tracker.spawn(h.evaluator.run());

    // Released at 300 s; the resume call is still in flight at 310 s.
    advance_to(305, start).await;
    assert_eq!(ctx.state.lock().backpressure, BackpressureState::Normal);
    assert_eq!(load.signals(), ["reduce"]);

    advance_to(330, start).await;
    assert_eq!(load.signals(), ["reduce", "resume", "reduce"]);
    {
        let state = ctx.state.lock();
        assert_eq!(state.backpressure, BackpressureState::Active);
        assert_eq!(state.backpressure_activations, 2);
        assert_eq!(state.violations.len(), 2);
    }

    ctx.token.cancel();
    ctx.tracker.close();
    ctx.tracker.wait().await;
}

/// Suspension blocks new injections but running faults still expire
#[tokio::test(start_paused = true)]
async fn test_suspension_does_not_block_expiry() {
    let config = config(vec![fault("cpu", 1.0, 5), fault("mem", 1.0, 5)], vec![]);
    let applier = FakeApplier::new();
    let h = Harness::new(&config, applier.clone(), ScriptedMetrics::new(), RecordingLoadGenerator::new());

    h.lifecycle.inject(Arc::new(fault("cpu", 1.0, 5))).await.unwrap();
    h.ctx.state.lock().backpressure = BackpressureState::Active;

    assert_eq!(h.scheduler.tick().await, 0);
    assert!(!h.ctx.state.lock().registry.is_active("mem"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(h.ctx.state.lock().registry.is_empty());
    assert_eq!(applier.reverts(), 1);
    assert_eq!(h.ctx.state.lock().backpressure, BackpressureState::Active);
}

/// A failed apply leaves nothing registered and schedules no revert
#[tokio::test(start_paused = true)]
async fn test_apply_failure_is_not_registered() {
    let config = config(vec![fault("cpu", 1.0, 5)], vec![]);
    let applier = FakeApplier::failing_apply();
    let h = Harness::new(&config, applier.clone(), ScriptedMetrics::new(), RecordingLoadGenerator::new());

    assert_eq!(h.scheduler.tick().await, 0);
    {
        let state = h.ctx.state.lock();
        assert!(state.registry.is_empty());
        assert_eq!(state.faults_injected, 0);
        assert_eq!(state.fault_stats["cpu"].apply_failures, 1);
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(applier.reverts(), 0);
    assert_eq!(h.sink.count(names::FAULT_APPLY_FAILURES), 1);
}

/// A failed revert still frees the name for the next injection
#[tokio::test(start_paused = true)]
async fn test_revert_failure_still_deactivates() {
    let config = config(vec![fault("cpu", 1.0, 5)], vec![]);
    let applier = FakeApplier::failing_revert();
    let h = Harness::new(&config, applier.clone(), ScriptedMetrics::new(), RecordingLoadGenerator::new());

    assert_eq!(h.scheduler.tick().await, 1);
    tokio::time::sleep(Duration::from_secs(6)).await;
    {
        let state = h.ctx.state.lock();
        assert!(state.registry.is_empty());
        assert_eq!(state.fault_stats["cpu"].revert_failures, 1);
        // Expiry failures are not cleanup failures.
        assert!(state.cleanup_failures.is_empty());
    }

    assert_eq!(h.scheduler.tick().await, 1);
    assert_eq!(applier.applies(), 2);
}

/// Concurrent injections of one name: the slot is claimed before apply runs
#[tokio::test(start_paused = true)]
async fn test_concurrent_inject_claims_one_slot() {
    let config = config(vec![fault("cpu", 1.0, 30)], vec![]);
    let applier = FakeApplier::slow(Duration::from_secs(2));
    let h = Harness::new(&config, applier.clone(), ScriptedMetrics::new(), RecordingLoadGenerator::new());
    let definition = Arc::new(fault("cpu", 1.0, 30));

    let (first, second) = tokio::join!(
        h.lifecycle.inject(Arc::clone(&definition)),
        h.lifecycle.inject(Arc::clone(&definition)),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(Error::AlreadyActive(_))));
    assert_eq!(applier.applies(), 1);
    assert_eq!(h.ctx.state.lock().registry.len(), 1);
}

/// Expiry and sweep racing for one fault revert it once
#[tokio::test(start_paused = true)]
async fn test_expiry_and_sweep_revert_once() {
    let config = config(vec![fault("cpu", 1.0, 5)], vec![]);
    let applier = FakeApplier::new();
    let h = Harness::new(&config, applier.clone(), ScriptedMetrics::new(), RecordingLoadGenerator::new());

    assert_eq!(h.scheduler.tick().await, 1);
    tokio::time::sleep(Duration::from_secs(5)).await;

    h.ctx.token.cancel();
    h.ctx.tracker.close();
    h.ctx.tracker.wait().await;
    assert!(h.lifecycle.retire_all().await.is_empty());

    assert_eq!(applier.reverts(), 1);
    assert!(h.ctx.state.lock().registry.is_empty());
}
