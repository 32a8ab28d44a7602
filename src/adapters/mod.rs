//! External collaborators: where metrics come from and what generates load

mod k6;
mod prometheus;

pub use self::k6::K6LoadGenerator;
pub use self::prometheus::PrometheusSource;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Answers windowed aggregate queries such as "p95 latency over the last minute".
///
/// A missing data point is [`Error::MetricsUnavailable`](crate::Error::MetricsUnavailable).
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Current value of `metric` aggregated over `window`
    async fn query(&self, metric: &str, window: Duration) -> Result<f64>;
}

/// Controls the process producing request traffic
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    /// Start generating load for the run `test_id`, lasting at most `duration`
    async fn start(&self, test_id: &str, duration: Duration) -> Result<()>;

    /// Throttle to the reduced rate
    async fn reduce_rate(&self) -> Result<()>;

    /// Return to the configured rate
    async fn resume_rate(&self) -> Result<()>;

    /// Whether load is still being generated
    async fn is_running(&self) -> bool;

    /// Stop generating load. Safe to call when not running.
    async fn stop(&self) -> Result<()>;
}

/// Stand-in when the run is driven by traffic from elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoadGenerator;

#[async_trait]
impl LoadGenerator for NoLoadGenerator {
    async fn start(&self, _test_id: &str, _duration: Duration) -> Result<()> {
        Ok(())
    }

    async fn reduce_rate(&self) -> Result<()> {
        Ok(())
    }

    async fn resume_rate(&self) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self) -> bool {
        true
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
