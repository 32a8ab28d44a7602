//! Injection scheduler
//!
//! Every tick, each fault that is not already active gets one probability
//! roll. Winners are injected through the [`FaultLifecycle`]. While
//! backpressure is active the tick injects nothing; expiry timers run on
//! their own tasks and are not affected.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog::FaultCatalog;
use crate::clock::ProbabilityRoll;
use crate::lifecycle::FaultLifecycle;
use crate::state::RunContext;
use crate::Error;

/// Rolls for and injects faults on a fixed interval
pub struct InjectionScheduler {
    ctx: RunContext,
    catalog: Arc<FaultCatalog>,
    lifecycle: FaultLifecycle,
    roll: Arc<dyn ProbabilityRoll>,
    interval: Duration,
}

impl InjectionScheduler {
    /// Create a scheduler
    pub fn new(
        ctx: RunContext,
        catalog: Arc<FaultCatalog>,
        lifecycle: FaultLifecycle,
        roll: Arc<dyn ProbabilityRoll>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            catalog,
            lifecycle,
            roll,
            interval,
        }
    }

    /// Run one tick. Returns how many faults were injected.
    pub async fn tick(&self) -> usize {
        let mut injected = 0;

        for definition in self.catalog.iter() {
            if self.ctx.token.is_cancelled() {
                debug!("Run cancelled; abandoning injection tick");
                break;
            }
            {
                let state = self.ctx.state.lock();
                if state.injections_suspended() {
                    debug!("Backpressure active; skipping injections");
                    break;
                }
                if state.registry.is_active(&definition.name) {
                    continue;
                }
            }

            let sample = self.roll.roll();
            if sample >= definition.probability {
                continue;
            }
            debug!(fault = %definition.name, sample, probability = definition.probability, "Roll succeeded");

            match self.lifecycle.inject(Arc::clone(definition)).await {
                Ok(_) => injected += 1,
                Err(Error::AlreadyActive(name)) => {
                    debug!(fault = %name, "Fault became active concurrently; skipping");
                }
                Err(Error::ShuttingDown(_)) => break,
                Err(e) => {
                    warn!(fault = %definition.name, kind = e.kind(), error = %e, "Fault injection failed");
                }
            }
        }

        injected
    }

    /// Tick until the run is cancelled
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, faults = self.catalog.len(), "Injection scheduler started");

        loop {
            tokio::select! {
                biased;
                () = self.ctx.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Injection scheduler stopped");
    }
}
