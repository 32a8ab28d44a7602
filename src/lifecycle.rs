//! Fault lifecycle: apply, expire, revert
//!
//! Expiry timers and the cleanup sweep both end in [`FaultLifecycle::retire`].
//! The registry hands out a fault's revert handle once, so whichever path
//! gets there first does the revert and the other finds nothing to do.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::catalog::FaultDefinition;
use crate::faults::ApplierSet;
use crate::registry::FaultPhase;
use crate::state::RunContext;
use crate::telemetry::names;
use crate::{Error, Result};

/// Why a fault is being reverted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Its duration elapsed
    Expired,
    /// The run is ending
    Shutdown,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Applies faults, schedules their expiry and reverts them
#[derive(Clone)]
pub struct FaultLifecycle {
    ctx: RunContext,
    appliers: Arc<ApplierSet>,
    applier_timeout: Duration,
}

impl FaultLifecycle {
    /// Create a lifecycle bound to a run
    pub fn new(ctx: RunContext, appliers: Arc<ApplierSet>, applier_timeout: Duration) -> Self {
        Self {
            ctx,
            appliers,
            applier_timeout,
        }
    }

    /// Apply a fault, register it and schedule its expiry.
    ///
    /// The registry slot is claimed before the applier runs. If apply fails
    /// or times out the slot is released again and no timer is scheduled.
    /// Once the run is cancelled nothing new is applied.
    /// Returns the expiry time.
    pub async fn inject(&self, definition: Arc<FaultDefinition>) -> Result<DateTime<Utc>> {
        let name = definition.name.as_str();
        let Some(applier) = self.appliers.get(&definition.fault_type) else {
            return Err(Error::applier(
                name,
                format!("no applier for fault type '{}'", definition.fault_type),
            ));
        };

        if self.ctx.token.is_cancelled() {
            return Err(Error::ShuttingDown(name.to_string()));
        }

        self.ctx
            .state
            .lock()
            .registry
            .activate(Arc::clone(&definition), self.ctx.clock.now())?;

        let started = Instant::now();
        let applied = match timeout(self.applier_timeout, applier.apply(&definition)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ApplierTimeout {
                fault: name.to_string(),
                timeout: self.applier_timeout,
            }),
        };

        let handle = match applied {
            Ok(handle) => handle,
            Err(e) => {
                {
                    let mut state = self.ctx.state.lock();
                    state.registry.deactivate(name);
                    state.stats_mut(name).apply_failures += 1;
                }
                self.ctx
                    .sink
                    .increment_counter(names::FAULT_APPLY_FAILURES, &[("fault", name.to_string())]);
                return Err(e);
            }
        };

        let described = handle.describe();
        let expires_at = {
            let mut state = self.ctx.state.lock();
            let expires_at = state.registry.attach(name, handle, self.ctx.clock.now());
            if expires_at.is_some() {
                state.faults_injected += 1;
                state.stats_mut(name).injected += 1;
            }
            expires_at
        }
        .ok_or_else(|| Error::Internal(format!("registry slot for '{name}' vanished during apply")))?;

        let type_label = definition.fault_type.to_string();
        self.ctx.sink.increment_counter(
            names::FAULTS_INJECTED,
            &[
                ("fault_type", type_label.clone()),
                ("severity", definition.severity.to_string()),
            ],
        );
        self.ctx.sink.observe_histogram(
            names::FAULT_APPLY_SECONDS,
            started.elapsed().as_secs_f64(),
            &[("fault_type", type_label.clone())],
        );
        self.ctx.sink.set_gauge(names::FAULT_ACTIVE, 1.0, &[("type", type_label)]);

        info!(
            fault = %name,
            fault_type = %definition.fault_type,
            severity = %definition.severity,
            handle = %described,
            %expires_at,
            "Fault injected"
        );

        self.schedule_expiry(definition);
        Ok(expires_at)
    }

    /// Spawn the timer that retires a fault after its duration.
    ///
    /// Cancellation of the run fires the timer early instead of dropping it.
    fn schedule_expiry(&self, definition: Arc<FaultDefinition>) {
        let lifecycle = self.clone();
        let duration = definition.duration();
        self.ctx.tracker.spawn(async move {
            let reason = tokio::select! {
                () = tokio::time::sleep(duration) => RetireReason::Expired,
                () = lifecycle.ctx.token.cancelled() => RetireReason::Shutdown,
            };
            // Failures are logged and counted inside retire.
            let _ = lifecycle.retire(&definition.name, reason).await;
        });
    }

    /// Revert a fault and release its registry slot.
    ///
    /// Returns `Ok(false)` if another path already took the handle. A failed
    /// revert still releases the slot; the error is returned for reporting.
    pub async fn retire(&self, name: &str, reason: RetireReason) -> Result<bool> {
        let Some((definition, handle)) = self.ctx.state.lock().registry.begin_revert(name) else {
            debug!(fault = %name, %reason, "Nothing to revert");
            return Ok(false);
        };

        let outcome = match self.appliers.get(&definition.fault_type) {
            Some(applier) => {
                match timeout(self.applier_timeout, applier.revert(&definition, &handle)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ApplierTimeout {
                        fault: name.to_string(),
                        timeout: self.applier_timeout,
                    }),
                }
            }
            None => Err(Error::applier(name, "applier disappeared before revert")),
        };

        {
            let mut state = self.ctx.state.lock();
            state.registry.deactivate(name);
            if outcome.is_err() {
                state.stats_mut(name).revert_failures += 1;
                if reason == RetireReason::Shutdown {
                    state.cleanup_failures.push(name.to_string());
                }
            }
        }
        self.ctx.sink.set_gauge(
            names::FAULT_ACTIVE,
            0.0,
            &[("type", definition.fault_type.to_string())],
        );

        match outcome {
            Ok(()) => {
                info!(fault = %name, %reason, "Fault reverted");
                Ok(true)
            }
            Err(e) => {
                error!(
                    fault = %name,
                    %reason,
                    handle = %handle.describe(),
                    kind = e.kind(),
                    error = %e,
                    "Revert failed; fault effect may have leaked"
                );
                self.ctx
                    .sink
                    .increment_counter(names::FAULT_REVERT_FAILURES, &[("fault", name.to_string())]);
                Err(e)
            }
        }
    }

    /// Revert every fault still registered as active.
    ///
    /// Returns one [`Error::Cleanup`] per fault whose revert failed.
    pub async fn retire_all(&self) -> Vec<Error> {
        let names = self.ctx.state.lock().registry.names_in(FaultPhase::Active);
        if !names.is_empty() {
            warn!(count = names.len(), "Reverting faults still active at shutdown");
        }

        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.retire(&name, RetireReason::Shutdown).await {
                failures.push(Error::Cleanup(format!("{name}: {e}")));
            }
        }
        failures
    }
}
