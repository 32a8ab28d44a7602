//! Fakes shared by the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use chaos_gate::adapters::{LoadGenerator, MetricsSource};
use chaos_gate::backpressure::BackpressureController;
use chaos_gate::catalog::{FaultCatalog, FaultDefinition, FaultType, Severity};
use chaos_gate::clock::{ScriptedRoll, TokioClock};
use chaos_gate::config::Config;
use chaos_gate::evaluator::SloEvaluator;
use chaos_gate::faults::{ApplierSet, FaultApplier, FaultHandle};
use chaos_gate::lifecycle::FaultLifecycle;
use chaos_gate::orchestrator::RunDeps;
use chaos_gate::scheduler::InjectionScheduler;
use chaos_gate::slo::{ComparisonOperator, GateSeverity, SloGate};
use chaos_gate::state::RunContext;
use chaos_gate::telemetry::{Labels, MetricsSink};
use chaos_gate::{Error, Result};

/// Applier that counts calls and can be told to fail
#[derive(Default)]
pub struct FakeApplier {
    applies: AtomicUsize,
    reverts: AtomicUsize,
    fail_apply: AtomicBool,
    fail_revert: AtomicBool,
    apply_delay: Mutex<Duration>,
    events: Mutex<Vec<(&'static str, String)>>,
}

impl FakeApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_apply() -> Arc<Self> {
        let applier = Self::default();
        applier.fail_apply.store(true, Ordering::SeqCst);
        Arc::new(applier)
    }

    pub fn failing_revert() -> Arc<Self> {
        let applier = Self::default();
        applier.fail_revert.store(true, Ordering::SeqCst);
        Arc::new(applier)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        let applier = Self::default();
        *applier.apply_delay.lock() = delay;
        Arc::new(applier)
    }

    pub fn set_fail_revert(&self, fail: bool) {
        self.fail_revert.store(fail, Ordering::SeqCst);
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn reverts(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    /// `("apply" | "revert", fault name)` in call order
    pub fn events(&self) -> Vec<(&'static str, String)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl FaultApplier for FakeApplier {
    async fn apply(&self, fault: &FaultDefinition) -> Result<FaultHandle> {
        let delay = *self.apply_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::applier(&fault.name, "stress tool not installed"));
        }
        let n = self.applies.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(("apply", fault.name.clone()));
        Ok(FaultHandle::Token(n as u64))
    }

    async fn revert(&self, fault: &FaultDefinition, _handle: &FaultHandle) -> Result<()> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(("revert", fault.name.clone()));
        if self.fail_revert.load(Ordering::SeqCst) {
            return Err(Error::applier(&fault.name, "qdisc delete refused"));
        }
        Ok(())
    }
}

/// Per-metric sample queues; `None` means no data
#[derive(Default)]
pub struct ScriptedMetrics {
    series: Mutex<HashMap<String, (VecDeque<Option<f64>>, Option<f64>)>>,
    queries: AtomicUsize,
}

impl ScriptedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `samples` for `metric`, then return `then` forever
    pub fn with(
        self,
        metric: &str,
        samples: impl IntoIterator<Item = Option<f64>>,
        then: Option<f64>,
    ) -> Self {
        self.series
            .lock()
            .insert(metric.to_string(), (samples.into_iter().collect(), then));
        self
    }

    pub fn constant(self, metric: &str, value: f64) -> Self {
        self.with(metric, [], Some(value))
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn query(&self, metric: &str, _window: Duration) -> Result<f64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut series = self.series.lock();
        let sample = match series.get_mut(metric) {
            Some((queue, then)) => queue.pop_front().unwrap_or(*then),
            None => None,
        };
        sample.ok_or_else(|| Error::MetricsUnavailable(format!("{metric}: no data")))
    }
}

/// Counts every control signal
#[derive(Default)]
pub struct RecordingLoadGenerator {
    pub starts: AtomicUsize,
    pub reduces: AtomicUsize,
    pub resumes: AtomicUsize,
    pub stops: AtomicUsize,
    running: AtomicBool,
    fail_start: AtomicBool,
    resume_delay: Mutex<Duration>,
    signals: Mutex<Vec<&'static str>>,
}

impl RecordingLoadGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_start() -> Arc<Self> {
        let load = Self::default();
        load.fail_start.store(true, Ordering::SeqCst);
        Arc::new(load)
    }

    /// `resume_rate` takes `delay` to complete
    pub fn slow_resume(delay: Duration) -> Arc<Self> {
        let load = Self::default();
        *load.resume_delay.lock() = delay;
        Arc::new(load)
    }

    /// `"reduce"` / `"resume"` in the order they completed
    pub fn signals(&self) -> Vec<&'static str> {
        self.signals.lock().clone()
    }

    /// Simulate the load generator finishing its script
    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn reduces(&self) -> usize {
        self.reduces.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadGenerator for RecordingLoadGenerator {
    async fn start(&self, _test_id: &str, _duration: Duration) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::LoadGenerator("k6 binary not found".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reduce_rate(&self) -> Result<()> {
        self.reduces.fetch_add(1, Ordering::SeqCst);
        self.signals.lock().push("reduce");
        Ok(())
    }

    async fn resume_rate(&self) -> Result<()> {
        let delay = *self.resume_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.signals.lock().push("resume");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every sample for inspection
#[derive(Default)]
pub struct RecordingSink {
    samples: Mutex<Vec<(&'static str, f64, Vec<(&'static str, String)>)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of increments recorded for a counter
    pub fn count(&self, name: &str) -> usize {
        self.samples.lock().iter().filter(|(n, _, _)| *n == name).count()
    }

    /// Increments of `name` carrying label `key=value`
    pub fn count_with(&self, name: &str, key: &str, value: &str) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|(n, _, labels)| {
                *n == name && labels.iter().any(|(k, v)| *k == key && v == value)
            })
            .count()
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.samples
            .lock()
            .iter()
            .rev()
            .find(|(n, _, _)| *n == name)
            .map(|(_, v, _)| *v)
    }

    fn push(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.samples.lock().push((name, value, labels.to_vec()));
    }
}

impl MetricsSink for RecordingSink {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        self.push(name, 1.0, labels);
    }

    fn observe_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.push(name, value, labels);
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.push(name, value, labels);
    }
}

pub fn fault(name: &str, probability: f64, duration_seconds: u64) -> FaultDefinition {
    FaultDefinition {
        name: name.to_string(),
        fault_type: FaultType::Cpu,
        severity: Severity::High,
        duration_seconds,
        probability,
        parameters: BTreeMap::new(),
        slo_impact: vec!["p95-latency".to_string()],
    }
}

pub fn gate(name: &str, metric: &str, severity: GateSeverity, trigger: bool) -> SloGate {
    SloGate {
        name: name.to_string(),
        metric: metric.to_string(),
        threshold: 0.5,
        operator: ComparisonOperator::Gt,
        window_seconds: 60,
        severity,
        backpressure_trigger: trigger,
    }
}

/// A config with default timing and no load generator script requirement
pub fn config(faults: Vec<FaultDefinition>, gates: Vec<SloGate>) -> Config {
    let mut config = Config {
        name: "integration".to_string(),
        duration_minutes: 10,
        faults,
        slo_gates: gates,
        ..Config::default()
    };
    config.load_generator.script = "load/test.js".to_string();
    config
}

pub fn deps(
    applier: Arc<FakeApplier>,
    metrics: ScriptedMetrics,
    load: Arc<RecordingLoadGenerator>,
    sink: Arc<RecordingSink>,
) -> RunDeps {
    RunDeps {
        appliers: ApplierSet::new().with(FaultType::Cpu, applier),
        metrics: Arc::new(metrics),
        load_generator: load,
        sink,
        clock: Arc::new(TokioClock::new()),
        roll: Arc::new(ScriptedRoll::constant(0.0)),
    }
}

/// Components wired the way a run wires them, loops not yet started
pub struct Harness {
    pub ctx: RunContext,
    pub lifecycle: FaultLifecycle,
    pub backpressure: BackpressureController,
    pub scheduler: InjectionScheduler,
    pub evaluator: SloEvaluator,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(
        config: &Config,
        applier: Arc<FakeApplier>,
        metrics: ScriptedMetrics,
        load: Arc<RecordingLoadGenerator>,
    ) -> Self {
        let sink = RecordingSink::new();
        let ctx = RunContext::new(sink.clone(), Arc::new(TokioClock::new()));
        let appliers = Arc::new(ApplierSet::new().with(FaultType::Cpu, applier));
        let lifecycle =
            FaultLifecycle::new(ctx.clone(), appliers, config.schedule.applier_timeout);
        let backpressure = BackpressureController::new(ctx.clone(), load, &config.backpressure);
        let catalog = Arc::new(FaultCatalog::register(config.faults.clone()).unwrap());
        let scheduler = InjectionScheduler::new(
            ctx.clone(),
            catalog,
            lifecycle.clone(),
            Arc::new(ScriptedRoll::constant(0.0)),
            config.schedule.injection_interval,
        );
        let evaluator = SloEvaluator::new(
            ctx.clone(),
            config.slo_gates.clone(),
            Arc::new(metrics),
            backpressure.clone(),
            config.schedule.evaluation_interval,
        );
        Self {
            ctx,
            lifecycle,
            backpressure,
            scheduler,
            evaluator,
            sink,
        }
    }
}
