//! Packet-loss applier built on `tc qdisc ... netem`
//!
//! The rule is host-global state; only the registry's one-instance-per-name
//! invariant keeps two runs of the same fault from stacking.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{FaultApplier, FaultHandle};
use crate::catalog::FaultDefinition;
use crate::{Error, Result};

/// Adds a netem loss rule on apply and deletes it on revert
pub struct NetemApplier {
    tc_program: String,
    default_interface: String,
}

impl NetemApplier {
    /// Create an applier using `tc_program` on `default_interface`
    #[must_use]
    pub fn new(tc_program: &str, default_interface: &str) -> Self {
        Self {
            tc_program: tc_program.to_string(),
            default_interface: default_interface.to_string(),
        }
    }

    /// Arguments for adding the rule
    #[must_use]
    pub fn add_args(interface: &str, loss_percent: u64) -> Vec<String> {
        [
            "qdisc",
            "add",
            "dev",
            interface,
            "root",
            "netem",
            "loss",
            &format!("{}%", loss_percent.min(100)),
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    /// Arguments for deleting the rule
    #[must_use]
    pub fn del_args(interface: &str) -> Vec<String> {
        ["qdisc", "del", "dev", interface, "root"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    async fn tc(&self, fault: &str, args: &[String]) -> Result<()> {
        let output = Command::new(&self.tc_program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::applier(fault, format!("failed to run {}: {e}", self.tc_program)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::applier(
                fault,
                format!(
                    "{} {} exited with {}: {}",
                    self.tc_program,
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

#[async_trait]
impl FaultApplier for NetemApplier {
    async fn apply(&self, fault: &FaultDefinition) -> Result<FaultHandle> {
        let interface = fault
            .param_str("interface")
            .unwrap_or(&self.default_interface)
            .to_string();
        let loss_percent = fault.param_u64("loss_percent", 20);

        self.tc(&fault.name, &Self::add_args(&interface, loss_percent))
            .await?;
        info!(fault = %fault.name, %interface, loss_percent, "Packet loss rule added");

        Ok(FaultHandle::Netem(NetemRule::new(&interface)))
    }

    async fn revert(&self, fault: &FaultDefinition, handle: &FaultHandle) -> Result<()> {
        let FaultHandle::Netem(rule) = handle else {
            return Err(Error::applier(
                &fault.name,
                format!("netem applier cannot revert {}", handle.describe()),
            ));
        };

        if rule.is_removed() {
            debug!(fault = %fault.name, "Packet loss rule already removed");
            return Ok(());
        }

        self.tc(&fault.name, &Self::del_args(&rule.interface))
            .await?;
        rule.removed.store(true, Ordering::Release);
        info!(fault = %fault.name, interface = %rule.interface, "Packet loss rule removed");
        Ok(())
    }
}

/// An installed netem rule
#[derive(Debug)]
pub struct NetemRule {
    interface: String,
    removed: AtomicBool,
}

impl NetemRule {
    /// Track a rule on `interface`
    #[must_use]
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            removed: AtomicBool::new(false),
        }
    }

    /// Interface the rule is attached to
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Whether revert already deleted the rule
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}
