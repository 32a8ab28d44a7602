//! SLO gates, violation records and the run's health score

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Health score ceiling and starting value
pub const MAX_HEALTH: f64 = 100.0;
/// Penalty for a critical violation
pub const CRITICAL_PENALTY: f64 = 20.0;
/// Penalty for any other violation
pub const WARNING_PENALTY: f64 = 5.0;

/// Comparison applied as `observed <op> threshold`; true means violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// `>`
    #[serde(rename = ">", alias = "gt")]
    Gt,
    /// `<`
    #[serde(rename = "<", alias = "lt")]
    Lt,
    /// `>=`
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    /// `<=`
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    /// `==`
    #[serde(rename = "==", alias = "eq")]
    Eq,
}

impl ComparisonOperator {
    /// Evaluate against a threshold. NaN never violates.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn evaluate(self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Lt => observed < threshold,
            Self::Gte => observed >= threshold,
            Self::Lte => observed <= threshold,
            Self::Eq => observed == threshold,
        }
    }

    /// Operator symbol
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Eq => "==",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Gate severity, weighting the health penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateSeverity {
    /// Costs [`WARNING_PENALTY`]
    Warning,
    /// Costs [`CRITICAL_PENALTY`]
    Critical,
}

impl GateSeverity {
    /// Health penalty per violation
    #[must_use]
    pub fn penalty(self) -> f64 {
        match self {
            Self::Warning => WARNING_PENALTY,
            Self::Critical => CRITICAL_PENALTY,
        }
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for GateSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_window_seconds() -> u64 {
    60
}

/// A service-level objective checked on every evaluator tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloGate {
    /// Gate name
    pub name: String,
    /// Metric key resolved by the metrics source
    pub metric: String,
    /// Threshold the observed value is compared against
    pub threshold: f64,
    /// Comparison that signals a violation
    pub operator: ComparisonOperator,
    /// Aggregation window for the metric query
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Penalty weight
    pub severity: GateSeverity,
    /// Whether a violation engages backpressure
    #[serde(default)]
    pub backpressure_trigger: bool,
}

impl SloGate {
    /// Query window
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Whether `observed` violates this gate
    #[must_use]
    pub fn is_violated_by(&self, observed: f64) -> bool {
        self.operator.evaluate(observed, self.threshold)
    }

    /// Check the gate on its own
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("gate name must not be empty".to_string()));
        }
        if self.metric.trim().is_empty() {
            return Err(Error::Config(format!("gate '{}': metric must not be empty", self.name)));
        }
        if !self.threshold.is_finite() {
            return Err(Error::Config(format!(
                "gate '{}': threshold must be a finite number",
                self.name
            )));
        }
        if self.window_seconds == 0 {
            return Err(Error::Config(format!(
                "gate '{}': window_seconds must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// One failed gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloViolationRecord {
    /// When the violation was observed
    pub timestamp: DateTime<Utc>,
    /// Gate name
    pub slo_name: String,
    /// Metric key
    pub metric: String,
    /// Gate threshold
    pub threshold: f64,
    /// Gate operator
    pub operator: ComparisonOperator,
    /// Value returned by the metrics source
    pub observed_value: f64,
    /// Gate severity
    pub severity: GateSeverity,
}

impl SloViolationRecord {
    /// Build a record for a gate
    #[must_use]
    pub fn new(gate: &SloGate, observed_value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            slo_name: gate.name.clone(),
            metric: gate.metric.clone(),
            threshold: gate.threshold,
            operator: gate.operator,
            observed_value,
            severity: gate.severity,
        }
    }
}

/// Append-only violation log
#[derive(Debug, Default)]
pub struct ViolationLog {
    records: VecDeque<SloViolationRecord>,
}

impl ViolationLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, record: SloViolationRecord) {
        self.records.push_back(record);
    }

    /// Records younger than `lookback` at `now` (strictly inside the window)
    #[must_use]
    pub fn count_within(&self, now: DateTime<Utc>, lookback: Duration) -> usize {
        let lookback = chrono::TimeDelta::from_std(lookback).unwrap_or(chrono::TimeDelta::MAX);
        // Records are appended in time order, so scan from the newest end.
        self.records
            .iter()
            .rev()
            .take_while(|r| now.signed_duration_since(r.timestamp) < lookback)
            .count()
    }

    /// All records in append order
    pub fn iter(&self) -> impl Iterator<Item = &SloViolationRecord> {
        self.records.iter()
    }

    /// Total number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no violation was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Cumulative degradation signal in `[0, 100]`.
///
/// Starts at 100 and only ever decreases during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthScore(f64);

impl HealthScore {
    /// A fresh score of 100
    #[must_use]
    pub fn new() -> Self {
        Self(MAX_HEALTH)
    }

    /// Current value
    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }

    /// Apply the penalty for one violation, clamping at zero
    pub fn penalize(&mut self, severity: GateSeverity) -> f64 {
        self.0 = (self.0 - severity.penalty()).clamp(0.0, MAX_HEALTH);
        self.0
    }
}

impl Default for HealthScore {
    fn default() -> Self {
        Self::new()
    }
}
