//! Chaos Gate Library
//!
//! Chaos-injection and backpressure-gating engine: degrades a running system
//! with CPU, memory, disk and network faults while SLO gates are evaluated
//! against live metrics, and throttles itself when those gates trip.
//!
//! # Features
//!
//! - **Injection Scheduler**: periodic probability rolls, one instance per fault, auto-expiry
//! - **SLO Evaluator**: windowed metric queries, violation log, health score
//! - **Backpressure**: reduces load and suspends injection until the system stabilizes
//! - **Cleanup Sweep**: every injected fault is reverted on every exit path
//! - **Adapters**: stress-ng and `tc netem` appliers, Prometheus metrics, k6 load generator

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod backpressure;
pub mod catalog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod faults;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod slo;
pub mod state;
pub mod summary;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
