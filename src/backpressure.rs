//! Backpressure controller
//!
//! `Normal -> Active` on the first qualifying violation, `Active -> Normal`
//! once a stabilization check finds no violation inside the lookback window.
//! The state flag flips under the run lock before any signal goes out, so
//! concurrent triggers produce one episode with one reduce and one resume.
//! Each transition holds the signal lock until its signal has been sent, so
//! signals reach the load generator in transition order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::LoadGenerator;
use crate::config::BackpressureConfig;
use crate::slo::{SloGate, SloViolationRecord};
use crate::state::{BackpressureState, RunContext};
use crate::telemetry::names;

/// Owns the backpressure state transitions
#[derive(Clone)]
pub struct BackpressureController {
    ctx: RunContext,
    load: Arc<dyn LoadGenerator>,
    /// Held across a state transition and its load generator signal
    signals: Arc<Mutex<()>>,
    cooldown: Duration,
    lookback: Duration,
}

impl BackpressureController {
    /// Create a controller
    pub fn new(ctx: RunContext, load: Arc<dyn LoadGenerator>, config: &BackpressureConfig) -> Self {
        Self {
            ctx,
            load,
            signals: Arc::new(Mutex::new(())),
            cooldown: config.cooldown,
            lookback: config.lookback,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BackpressureState {
        self.ctx.state.lock().backpressure
    }

    /// Engage backpressure for a violation of `gate`.
    ///
    /// Returns `false` without side effects if already active.
    pub async fn activate(&self, gate: &SloGate, violation: &SloViolationRecord) -> bool {
        let _signals = self.signals.lock().await;
        {
            let mut state = self.ctx.state.lock();
            if state.backpressure == BackpressureState::Active {
                return false;
            }
            state.backpressure = BackpressureState::Active;
            state.backpressure_activations += 1;
        }

        warn!(
            gate = %gate.name,
            observed = violation.observed_value,
            threshold = gate.threshold,
            cooldown = ?self.cooldown,
            "Backpressure activated; reducing load and suspending injections"
        );
        self.ctx.sink.increment_counter(
            names::BACKPRESSURE_ACTIVATIONS,
            &[("trigger", gate.name.clone()), ("action", "activate".to_string())],
        );

        if let Err(e) = self.load.reduce_rate().await {
            warn!(error = %e, "Load generator did not accept rate reduction");
            self.ctx.state.lock().degraded = true;
        }

        let controller = self.clone();
        self.ctx.tracker.spawn(async move { controller.stabilize().await });
        true
    }

    /// Recheck every cooldown until the system is stable or the run ends
    async fn stabilize(self) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.cooldown) => {}
                () = self.ctx.token.cancelled() => return,
            }
            if self.check_stabilized().await {
                return;
            }
        }
    }

    /// One stabilization check. Returns whether backpressure was released.
    pub async fn check_stabilized(&self) -> bool {
        let _signals = self.signals.lock().await;
        let recent = {
            let mut state = self.ctx.state.lock();
            if state.backpressure != BackpressureState::Active {
                return true;
            }
            let recent = state.violations.count_within(self.ctx.clock.now(), self.lookback);
            if recent == 0 {
                state.backpressure = BackpressureState::Normal;
            }
            recent
        };

        if recent > 0 {
            debug!(recent, lookback = ?self.lookback, "Not yet stable; rechecking after cooldown");
            return false;
        }

        info!(lookback = ?self.lookback, "System stabilized; backpressure released");
        self.ctx.sink.increment_counter(
            names::BACKPRESSURE_ACTIVATIONS,
            &[("trigger", "stabilized".to_string()), ("action", "deactivate".to_string())],
        );
        if let Err(e) = self.load.resume_rate().await {
            warn!(error = %e, "Load generator did not accept rate resumption");
            self.ctx.state.lock().degraded = true;
        }
        true
    }
}
