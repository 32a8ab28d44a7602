//! SLO evaluator
//!
//! Queries every gate's metric each tick. A violated gate appends a record
//! and lowers the health score; a violated trigger gate engages
//! backpressure. Missing data skips the gate for that tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::adapters::MetricsSource;
use crate::backpressure::BackpressureController;
use crate::slo::{SloGate, SloViolationRecord};
use crate::state::{BackpressureState, RunContext};
use crate::telemetry::names;

/// What one evaluator tick observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Gates with a value inside their threshold
    pub passed: usize,
    /// Gates that produced a violation record
    pub violated: usize,
    /// Gates skipped for lack of data
    pub unavailable: usize,
}

/// Evaluates SLO gates on a fixed interval
pub struct SloEvaluator {
    ctx: RunContext,
    gates: Vec<SloGate>,
    metrics: Arc<dyn MetricsSource>,
    backpressure: BackpressureController,
    interval: Duration,
}

impl SloEvaluator {
    /// Create an evaluator
    pub fn new(
        ctx: RunContext,
        gates: Vec<SloGate>,
        metrics: Arc<dyn MetricsSource>,
        backpressure: BackpressureController,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            gates,
            metrics,
            backpressure,
            interval,
        }
    }

    /// Evaluate every gate once
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for gate in &self.gates {
            let observed = match self.metrics.query(&gate.metric, gate.window()).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(gate = %gate.name, metric = %gate.metric, error = %e, "No data for gate this tick");
                    self.ctx.sink.increment_counter(
                        names::METRIC_QUERY_FAILURES,
                        &[("slo_name", gate.name.clone())],
                    );
                    report.unavailable += 1;
                    continue;
                }
            };

            if !gate.is_violated_by(observed) {
                report.passed += 1;
                continue;
            }

            report.violated += 1;
            self.record_violation(gate, observed).await;
        }

        report
    }

    async fn record_violation(&self, gate: &SloGate, observed: f64) {
        let record = SloViolationRecord::new(gate, observed, self.ctx.clock.now());
        let (health, backpressure) = {
            let mut state = self.ctx.state.lock();
            state.violations.push(record.clone());
            (state.health.penalize(gate.severity), state.backpressure)
        };

        warn!(
            gate = %gate.name,
            metric = %gate.metric,
            observed,
            operator = %gate.operator,
            threshold = gate.threshold,
            severity = %gate.severity,
            health,
            "SLO violated"
        );
        self.ctx.sink.increment_counter(
            names::SLO_VIOLATIONS,
            &[
                ("slo_name", gate.name.clone()),
                ("severity", gate.severity.to_string()),
            ],
        );
        self.ctx.sink.set_gauge(names::SYSTEM_HEALTH, health, &[]);

        if gate.backpressure_trigger && backpressure == BackpressureState::Normal {
            self.backpressure.activate(gate, &record).await;
        }
    }

    /// Tick until the run is cancelled
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, gates = self.gates.len(), "SLO evaluator started");

        loop {
            tokio::select! {
                biased;
                () = self.ctx.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("SLO evaluator stopped");
    }
}
