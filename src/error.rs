//! Error types for chaos-gate

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for chaos-gate
pub type Result<T> = std::result::Result<T, Error>;

/// chaos-gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid fault or gate definition; the run does not start
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fault with this name already occupies the registry
    #[error("Fault already active: {0}")]
    AlreadyActive(String),

    /// The run is shutting down and accepts no new injections
    #[error("Run is shutting down; not injecting '{0}'")]
    ShuttingDown(String),

    /// A fault applier failed to apply or revert its effect
    #[error("Applier error for fault '{fault}': {message}")]
    Applier {
        /// Fault name
        fault: String,
        /// What went wrong
        message: String,
    },

    /// A fault applier did not finish within its bounded timeout
    #[error("Applier for fault '{fault}' timed out after {timeout:?}")]
    ApplierTimeout {
        /// Fault name
        fault: String,
        /// Configured bound
        timeout: Duration,
    },

    /// Metric has no data point this tick
    #[error("Metric unavailable: {0}")]
    MetricsUnavailable(String),

    /// Load generator crashed, refused a control signal, or is unreachable
    #[error("Load generator error: {0}")]
    LoadGenerator(String),

    /// Cleanup sweep could not revert an active fault
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an applier error for a fault
    pub fn applier(fault: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Applier {
            fault: fault.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts the run.
    ///
    /// Only configuration errors do; every runtime error is caught at the
    /// loop boundary and the loop continues on its next tick.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Short kind label used for logs and metric labels
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::AlreadyActive(_) => "already_active",
            Self::ShuttingDown(_) => "shutting_down",
            Self::Applier { .. } | Self::ApplierTimeout { .. } => "applier",
            Self::MetricsUnavailable(_) | Self::Http(_) => "metrics_unavailable",
            Self::LoadGenerator(_) => "load_generator",
            Self::Cleanup(_) => "cleanup",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Internal(_) => "internal",
        }
    }
}
