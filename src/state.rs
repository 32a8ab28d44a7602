//! Shared run state
//!
//! The registry, health score, violation log and backpressure state all live
//! behind one mutex. The two loops, expiry timers and stabilization checks
//! interleave at await points; none of them holds the lock across one.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::Clock;
use crate::registry::ActiveFaultRegistry;
use crate::slo::{HealthScore, ViolationLog};
use crate::telemetry::MetricsSink;

/// Backpressure controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureState {
    /// Injections allowed, load generator at full rate
    #[default]
    Normal,
    /// Injections suspended, load generator throttled
    Active,
}

/// Per-fault bookkeeping for the run summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultStats {
    /// Successful injections
    pub injected: u64,
    /// Applier failures during apply
    pub apply_failures: u64,
    /// Applier failures during revert
    pub revert_failures: u64,
}

/// Mutable state of one run
#[derive(Debug, Default)]
pub struct RunState {
    /// Active faults
    pub registry: ActiveFaultRegistry,
    /// Cumulative health signal
    pub health: HealthScore,
    /// Every violation, in order
    pub violations: ViolationLog,
    /// Backpressure controller state
    pub backpressure: BackpressureState,
    /// Completed Normal → Active transitions
    pub backpressure_activations: u64,
    /// Successful injections across all faults
    pub faults_injected: u64,
    /// Per-fault counters keyed by fault name
    pub fault_stats: BTreeMap<String, FaultStats>,
    /// Set when an external collaborator failed in a way that skews results
    pub degraded: bool,
    /// Faults whose revert failed during shutdown
    pub cleanup_failures: Vec<String>,
}

impl RunState {
    /// Fresh state for a new run
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a fault, created on first use
    pub fn stats_mut(&mut self, fault: &str) -> &mut FaultStats {
        self.fault_stats.entry(fault.to_string()).or_default()
    }

    /// Whether the scheduler must skip new injections
    #[must_use]
    pub fn injections_suspended(&self) -> bool {
        self.backpressure == BackpressureState::Active
    }
}

/// Handle to the run state shared by all components
pub type SharedState = Arc<Mutex<RunState>>;

/// Create a fresh shared state
#[must_use]
pub fn shared() -> SharedState {
    Arc::new(Mutex::new(RunState::new()))
}

/// What every run component shares: state, collaborators for time and
/// metrics, and the task set the cleanup sweep waits on.
#[derive(Clone)]
pub struct RunContext {
    /// Run state
    pub state: SharedState,
    /// Observability sink
    pub sink: Arc<dyn MetricsSink>,
    /// Time source for timestamps
    pub clock: Arc<dyn Clock>,
    /// Loops, expiry timers and stabilization checks
    pub tracker: TaskTracker,
    /// Cancelled when the run ends
    pub token: CancellationToken,
}

impl RunContext {
    /// Fresh context with empty state
    pub fn new(sink: Arc<dyn MetricsSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: shared(),
            sink,
            clock,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }
}
