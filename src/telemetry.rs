//! Observability sink
//!
//! Components receive an `Arc<dyn MetricsSink>` instead of touching global
//! counters, so each one can be tested against a recording sink.

use std::net::SocketAddr;

use telemetry_metrics::Label;
use tracing::info;

use crate::Result;

/// Label pairs attached to a sample
pub type Labels<'a> = &'a [(&'static str, String)];

/// Metric names emitted by the engine
pub mod names {
    /// Counter: successful injections, by `fault_type` and `severity`
    pub const FAULTS_INJECTED: &str = "chaos_faults_injected_total";
    /// Counter: apply failures, by `fault`
    pub const FAULT_APPLY_FAILURES: &str = "chaos_fault_apply_failures_total";
    /// Counter: revert failures, by `fault`
    pub const FAULT_REVERT_FAILURES: &str = "chaos_fault_revert_failures_total";
    /// Histogram: apply latency in seconds, by `fault_type`
    pub const FAULT_APPLY_SECONDS: &str = "chaos_fault_apply_seconds";
    /// Gauge: 1 while a fault of `type` is active
    pub const FAULT_ACTIVE: &str = "fault_active";
    /// Counter: violations, by `slo_name` and `severity`
    pub const SLO_VIOLATIONS: &str = "slo_violations_total";
    /// Counter: failed metric queries, by `slo_name`
    pub const METRIC_QUERY_FAILURES: &str = "slo_metric_query_failures_total";
    /// Counter: backpressure transitions, by `trigger` and `action`
    pub const BACKPRESSURE_ACTIVATIONS: &str = "backpressure_activations_total";
    /// Gauge: current health score
    pub const SYSTEM_HEALTH: &str = "system_health_score";
}

/// Destination for counters, histograms and gauges
pub trait MetricsSink: Send + Sync {
    /// Add one to a counter
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>);

    /// Record a histogram sample
    fn observe_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>);

    /// Set a gauge
    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>) {}
    fn observe_histogram(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}
    fn set_gauge(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}
}

/// Forwards to the process-wide `metrics` recorder
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

fn to_labels(labels: Labels<'_>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for MetricsFacade {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        telemetry_metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn observe_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        telemetry_metrics::histogram!(name, to_labels(labels)).record(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        telemetry_metrics::gauge!(name, to_labels(labels)).set(value);
    }
}

/// Serve recorded metrics for scraping on `listen`.
///
/// Must be called from inside a tokio runtime.
#[cfg(feature = "metrics")]
pub fn install_exporter(listen: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| crate::Error::Internal(format!("failed to install metrics exporter: {e}")))?;
    info!(%listen, "Metrics exporter listening");
    Ok(())
}

/// Without the `metrics` feature there is nothing to serve.
#[cfg(not(feature = "metrics"))]
pub fn install_exporter(listen: SocketAddr) -> Result<()> {
    info!(%listen, "Metrics exporter not compiled in; skipping");
    Ok(())
}
