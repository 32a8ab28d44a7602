//! Fault appliers: the code that actually degrades the host
//!
//! Each [`FaultType`] maps to one [`FaultApplier`]. Appliers hand back a
//! [`FaultHandle`] from `apply` that carries everything `revert` needs, so the
//! controller only ever tracks lifecycles, never effects.

mod netem;
mod process;

pub use self::netem::{NetemApplier, NetemRule};
pub use self::process::{ProcessApplier, ProcessHandle, StressKind};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::catalog::{FaultDefinition, FaultType};
use crate::config::ApplierConfig;

/// Everything needed to undo one applied fault
#[derive(Debug)]
pub enum FaultHandle {
    /// A spawned stress process, killed on revert
    Process(ProcessHandle),
    /// A traffic-control rule, deleted on revert
    Netem(NetemRule),
    /// Opaque token for custom appliers
    Token(u64),
}

impl FaultHandle {
    /// Short description for logs
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Process(p) => format!("process {}", p.describe()),
            Self::Netem(r) => format!("netem rule on {}", r.interface()),
            Self::Token(t) => format!("token {t}"),
        }
    }
}

/// Applies and reverts one kind of fault.
///
/// `revert` must be safe to call more than once for the same handle.
#[async_trait]
pub trait FaultApplier: Send + Sync {
    /// Start the fault's effect
    async fn apply(&self, fault: &FaultDefinition) -> Result<FaultHandle>;

    /// Undo the effect identified by `handle`
    async fn revert(&self, fault: &FaultDefinition, handle: &FaultHandle) -> Result<()>;
}

/// Applier lookup by fault type
#[derive(Clone, Default)]
pub struct ApplierSet {
    appliers: HashMap<FaultType, Arc<dyn FaultApplier>>,
}

impl ApplierSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in appliers for cpu, memory, disk-io and network-loss
    #[must_use]
    pub fn with_defaults(config: &ApplierConfig) -> Self {
        let mut set = Self::new();
        set.register(
            FaultType::Cpu,
            Arc::new(ProcessApplier::new(StressKind::Cpu, &config.stress_program)),
        );
        set.register(
            FaultType::Memory,
            Arc::new(ProcessApplier::new(StressKind::Memory, &config.stress_program)),
        );
        set.register(
            FaultType::DiskIo,
            Arc::new(ProcessApplier::new(StressKind::DiskIo, &config.stress_program)),
        );
        set.register(
            FaultType::NetworkLoss,
            Arc::new(NetemApplier::new(&config.tc_program, &config.network_interface)),
        );
        set
    }

    /// Register (or replace) the applier for a fault type
    pub fn register(&mut self, fault_type: FaultType, applier: Arc<dyn FaultApplier>) {
        self.appliers.insert(fault_type, applier);
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, fault_type: FaultType, applier: Arc<dyn FaultApplier>) -> Self {
        self.register(fault_type, applier);
        self
    }

    /// Applier for a fault type
    #[must_use]
    pub fn get(&self, fault_type: &FaultType) -> Option<Arc<dyn FaultApplier>> {
        self.appliers.get(fault_type).cloned()
    }

    /// Whether an applier is registered for the type
    #[must_use]
    pub fn supports(&self, fault_type: &FaultType) -> bool {
        self.appliers.contains_key(fault_type)
    }
}
