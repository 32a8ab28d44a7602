//! Run summary: the JSON document reporting tools consume

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::Result;
use crate::slo::SloViolationRecord;
use crate::state::{FaultStats, RunState};

/// Why the run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Configured duration elapsed
    DurationElapsed,
    /// Load generator finished on its own
    LoadGeneratorFinished,
    /// Interrupted by a signal
    Shutdown,
    /// A control loop stopped unexpectedly
    LoopFailed,
}

impl EndReason {
    /// Label used in logs and the console block
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DurationElapsed => "duration elapsed",
            Self::LoadGeneratorFinished => "load generator finished",
            Self::Shutdown => "shutdown requested",
            Self::LoopFailed => "control loop failed",
        }
    }
}

/// Result of one chaos run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Run identifier
    pub test_id: String,
    /// Run name from configuration
    pub name: String,
    /// When the run started
    pub start_time: DateTime<Utc>,
    /// When the cleanup sweep finished
    pub end_time: DateTime<Utc>,
    /// Why the run stopped
    pub end_reason: EndReason,
    /// Successful injections
    pub total_faults_injected: u64,
    /// Every violation in order
    pub slo_violations: Vec<SloViolationRecord>,
    /// Normal -> Active transitions
    pub backpressure_activations: u64,
    /// Health score after the last violation
    pub final_health_score: f64,
    /// An external collaborator misbehaved during the run
    pub degraded: bool,
    /// Per-fault counters
    pub fault_results: BTreeMap<String, FaultStats>,
    /// Faults the cleanup sweep could not revert
    pub cleanup_failures: Vec<String>,
}

impl RunSummary {
    /// Snapshot a finished run
    #[must_use]
    pub fn from_state(
        test_id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        end_reason: EndReason,
        state: &RunState,
    ) -> Self {
        Self {
            test_id: test_id.to_string(),
            name: name.to_string(),
            start_time,
            end_time,
            end_reason,
            total_faults_injected: state.faults_injected,
            slo_violations: state.violations.iter().cloned().collect(),
            backpressure_activations: state.backpressure_activations,
            final_health_score: state.health.value(),
            degraded: state.degraded,
            fault_results: state.fault_stats.clone(),
            cleanup_failures: state.cleanup_failures.clone(),
        }
    }

    /// Whether every fault was reverted
    #[must_use]
    pub fn cleanup_succeeded(&self) -> bool {
        self.cleanup_failures.is_empty()
    }

    /// `chaos_test_<testId>.json`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("chaos_test_{}.json", self.test_id)
    }

    /// Write the summary into `dir`, creating it if needed
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        info!(path = %path.display(), "Run summary written");
        Ok(path)
    }

    /// Human-readable block for the terminal
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let duration = (self.end_time - self.start_time).num_seconds();
        let _ = writeln!(out, "Chaos run summary: {} ({})", self.name, self.test_id);
        let _ = writeln!(out, "  Ended:                   {} after {duration}s", self.end_reason.as_str());
        let _ = writeln!(out, "  Faults injected:         {}", self.total_faults_injected);
        let _ = writeln!(out, "  SLO violations:          {}", self.slo_violations.len());
        let _ = writeln!(out, "  Backpressure activations: {}", self.backpressure_activations);
        let _ = writeln!(out, "  Final health score:      {:.1}", self.final_health_score);
        if self.degraded {
            let _ = writeln!(out, "  Results degraded: load generator or control signals failed");
        }

        if !self.fault_results.is_empty() {
            let _ = writeln!(out, "  Faults:");
            for (name, stats) in &self.fault_results {
                let _ = writeln!(
                    out,
                    "    {name:<24} injected {:>3}  apply failures {:>3}  revert failures {:>3}",
                    stats.injected, stats.apply_failures, stats.revert_failures
                );
            }
        }

        if !self.cleanup_failures.is_empty() {
            let _ = writeln!(out, "  NOT REVERTED: {}", self.cleanup_failures.join(", "));
        }
        out
    }
}
