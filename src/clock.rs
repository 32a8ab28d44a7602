//! Injectable time and randomness
//!
//! Violation timestamps and probability rolls go through these traits so
//! tests can drive exact tick sequences.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Wall-clock source
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall time anchored at creation and advanced by tokio's monotonic clock.
///
/// Under a paused tokio runtime this clock moves only when tokio time does,
/// which keeps timestamps consistent with timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor at the current wall time
    #[must_use]
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.origin.elapsed();
        chrono::TimeDelta::from_std(elapsed)
            .ok()
            .and_then(|d| self.wall_origin.checked_add_signed(d))
            .unwrap_or(self.wall_origin)
    }
}

/// Uniform sample source in `[0, 1)` for injection rolls
pub trait ProbabilityRoll: Send + Sync {
    /// Draw one sample
    fn roll(&self) -> f64;
}

/// Thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRoll;

impl ProbabilityRoll for ThreadRoll {
    fn roll(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Replays a fixed sequence, then repeats the last value (or `fallback`)
#[derive(Debug)]
pub struct ScriptedRoll {
    samples: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl ScriptedRoll {
    /// Replay `samples`, then return `fallback` forever
    pub fn new(samples: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
            fallback,
        }
    }

    /// Always return `value`
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self::new([], value)
    }
}

impl ProbabilityRoll for ScriptedRoll {
    fn roll(&self) -> f64 {
        self.samples.lock().pop_front().unwrap_or(self.fallback)
    }
}
