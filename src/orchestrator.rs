//! Run orchestrator
//!
//! Starts the load generator and both control loops, waits for the first
//! end condition, then runs the cleanup sweep: cancel every task, let
//! in-flight reverts finish, revert whatever is still active, stop the load
//! generator and only then build the summary. The sweep runs on every exit
//! path, including a loop that panicked.

use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{K6LoadGenerator, LoadGenerator, MetricsSource, NoLoadGenerator, PrometheusSource};
use crate::backpressure::BackpressureController;
use crate::catalog::FaultCatalog;
use crate::clock::{Clock, ProbabilityRoll, ThreadRoll, TokioClock};
use crate::config::Config;
use crate::evaluator::SloEvaluator;
use crate::faults::ApplierSet;
use crate::lifecycle::FaultLifecycle;
use crate::registry::FaultPhase;
use crate::scheduler::InjectionScheduler;
use crate::slo::MAX_HEALTH;
use crate::state::RunContext;
use crate::summary::{EndReason, RunSummary};
use crate::telemetry::{MetricsFacade, MetricsSink, names};
use crate::{Error, Result};

/// External collaborators of a run
pub struct RunDeps {
    /// Appliers by fault type
    pub appliers: ApplierSet,
    /// Gate metric source
    pub metrics: Arc<dyn MetricsSource>,
    /// Load generator
    pub load_generator: Arc<dyn LoadGenerator>,
    /// Observability sink
    pub sink: Arc<dyn MetricsSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Injection rolls
    pub roll: Arc<dyn ProbabilityRoll>,
}

impl RunDeps {
    /// Production wiring: stress-ng/tc appliers, Prometheus, k6
    pub fn from_config(config: &Config) -> Result<Self> {
        let load_generator: Arc<dyn LoadGenerator> = if config.load_generator.enabled {
            Arc::new(K6LoadGenerator::new(config.load_generator.clone())?)
        } else {
            Arc::new(NoLoadGenerator)
        };

        Ok(Self {
            appliers: ApplierSet::with_defaults(&config.appliers),
            metrics: Arc::new(PrometheusSource::new(&config.metrics)?),
            load_generator,
            sink: Arc::new(MetricsFacade),
            clock: Arc::new(TokioClock::new()),
            roll: Arc::new(ThreadRoll),
        })
    }
}

/// A validated run, ready to start
pub struct Orchestrator {
    config: Config,
    catalog: Arc<FaultCatalog>,
    deps: RunDeps,
    test_id: String,
}

impl Orchestrator {
    /// Validate configuration against the available appliers.
    ///
    /// Fails with [`Error::Config`] before anything is started.
    pub fn new(config: Config, deps: RunDeps) -> Result<Self> {
        let catalog = config.validate()?;
        for definition in catalog.iter() {
            if !deps.appliers.supports(&definition.fault_type) {
                return Err(Error::Config(format!(
                    "fault '{}': no applier for type '{}'",
                    definition.name, definition.fault_type
                )));
            }
        }

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            deps,
            test_id: Uuid::new_v4().simple().to_string(),
        })
    }

    /// Use a fixed run identifier
    #[must_use]
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = test_id.into();
        self
    }

    /// Run identifier
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Execute the run until it ends or `shutdown` resolves.
    ///
    /// Always returns a summary; chaos outcomes are never errors.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RunSummary {
        let Self {
            config,
            catalog,
            deps,
            test_id,
        } = self;

        let ctx = RunContext::new(Arc::clone(&deps.sink), Arc::clone(&deps.clock));
        let start_time = ctx.clock.now();
        let run_duration = config.run_duration();
        ctx.sink.set_gauge(names::SYSTEM_HEALTH, MAX_HEALTH, &[]);

        info!(
            test_id = %test_id,
            name = %config.name,
            duration = ?run_duration,
            faults = catalog.len(),
            gates = config.slo_gates.len(),
            "Starting chaos run"
        );

        let load = Arc::clone(&deps.load_generator);
        let load_started = match load.start(&test_id, run_duration).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Load generator failed to start; continuing without it");
                ctx.state.lock().degraded = true;
                false
            }
        };

        let lifecycle = FaultLifecycle::new(
            ctx.clone(),
            Arc::new(deps.appliers),
            config.schedule.applier_timeout,
        );
        let backpressure =
            BackpressureController::new(ctx.clone(), Arc::clone(&load), &config.backpressure);
        let scheduler = InjectionScheduler::new(
            ctx.clone(),
            Arc::clone(&catalog),
            lifecycle.clone(),
            deps.roll,
            config.schedule.injection_interval,
        );
        let evaluator = SloEvaluator::new(
            ctx.clone(),
            config.slo_gates.clone(),
            deps.metrics,
            backpressure,
            config.schedule.evaluation_interval,
        );

        let mut scheduler_task = ctx.tracker.spawn(scheduler.run());
        let mut evaluator_task = ctx.tracker.spawn(evaluator.run());

        let poll_interval = config.load_generator.poll_interval;
        let completion = async {
            if load_started {
                wait_for_completion(load.as_ref(), poll_interval).await;
            } else {
                pending::<()>().await;
            }
        };

        let end_reason = tokio::select! {
            () = tokio::time::sleep(run_duration) => EndReason::DurationElapsed,
            () = completion => EndReason::LoadGeneratorFinished,
            () = shutdown => EndReason::Shutdown,
            joined = &mut scheduler_task => loop_ended("injection scheduler", joined),
            joined = &mut evaluator_task => loop_ended("SLO evaluator", joined),
        };
        if end_reason == EndReason::LoopFailed {
            ctx.state.lock().degraded = true;
        }
        info!(reason = end_reason.as_str(), "Run ending; starting cleanup sweep");

        sweep(&ctx, &lifecycle, load.as_ref()).await;

        let end_time = ctx.clock.now();
        let summary = {
            let state = ctx.state.lock();
            RunSummary::from_state(&test_id, &config.name, start_time, end_time, end_reason, &state)
        };

        if summary.cleanup_succeeded() {
            info!(
                test_id = %test_id,
                faults_injected = summary.total_faults_injected,
                violations = summary.slo_violations.len(),
                health = summary.final_health_score,
                "Chaos run complete"
            );
        } else {
            error!(
                test_id = %test_id,
                faults = ?summary.cleanup_failures,
                "Chaos run complete but some faults were not reverted"
            );
        }
        summary
    }
}

/// Poll until the load generator reports it has stopped
async fn wait_for_completion(load: &dyn LoadGenerator, poll_interval: Duration) {
    loop {
        tokio::time::sleep(poll_interval).await;
        if !load.is_running().await {
            return;
        }
    }
}

fn loop_ended(name: &str, joined: std::result::Result<(), tokio::task::JoinError>) -> EndReason {
    match joined {
        Ok(()) => error!(task = name, "Control loop exited early"),
        Err(e) => error!(task = name, error = %e, "Control loop panicked"),
    }
    EndReason::LoopFailed
}

/// Cancel, drain, revert, stop
async fn sweep(ctx: &RunContext, lifecycle: &FaultLifecycle, load: &dyn LoadGenerator) {
    ctx.token.cancel();
    ctx.tracker.close();
    ctx.tracker.wait().await;

    let failures = lifecycle.retire_all().await;
    for e in &failures {
        error!(error = %e, "Cleanup could not revert fault");
    }

    {
        let mut state = ctx.state.lock();
        if !state.registry.is_empty() {
            let mut stuck = state.registry.names_in(FaultPhase::Pending);
            stuck.extend(state.registry.names_in(FaultPhase::Reverting));
            warn!(faults = ?stuck, "Registry not empty after sweep");
            state.cleanup_failures.extend(stuck);
        }
    }

    if let Err(e) = load.stop().await {
        warn!(error = %e, "Failed to stop load generator");
        ctx.state.lock().degraded = true;
    }
}
