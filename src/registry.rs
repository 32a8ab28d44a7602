//! Active-fault registry
//!
//! Holds at most one [`ActiveFault`] per fault name. A slot is claimed before
//! the applier runs and released only after revert completed, so a name can
//! never be re-injected while its previous effect is still on the host.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::FaultDefinition;
use crate::faults::FaultHandle;
use crate::{Error, Result};

/// Where a registry slot is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPhase {
    /// Slot claimed, applier still running
    Pending,
    /// Effect applied, expiry scheduled
    Active,
    /// Revert handle taken, revert in progress
    Reverting,
}

/// A running fault instance
#[derive(Debug)]
pub struct ActiveFault {
    /// Definition this instance was created from
    pub definition: Arc<FaultDefinition>,
    /// When the effect started
    pub started_at: DateTime<Utc>,
    /// `started_at + duration_seconds`
    pub expires_at: DateTime<Utc>,
    phase: FaultPhase,
    handle: Option<FaultHandle>,
}

impl ActiveFault {
    fn new(definition: Arc<FaultDefinition>, now: DateTime<Utc>) -> Self {
        let expires_at = expiry(&definition, now);
        Self {
            definition,
            started_at: now,
            expires_at,
            phase: FaultPhase::Pending,
            handle: None,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> FaultPhase {
        self.phase
    }
}

fn expiry(definition: &FaultDefinition, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = i64::try_from(definition.duration_seconds).unwrap_or(i64::MAX);
    chrono::TimeDelta::try_seconds(secs)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Registry of active faults keyed by fault name
#[derive(Debug, Default)]
pub struct ActiveFaultRegistry {
    faults: HashMap<String, ActiveFault>,
}

impl ActiveFaultRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the name occupies a slot in any phase
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.faults.contains_key(name)
    }

    /// Claim the slot for a definition.
    ///
    /// Fails with [`Error::AlreadyActive`] if the name is already present,
    /// whatever its phase.
    pub fn activate(
        &mut self,
        definition: Arc<FaultDefinition>,
        now: DateTime<Utc>,
    ) -> Result<&ActiveFault> {
        use std::collections::hash_map::Entry;

        match self.faults.entry(definition.name.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyActive(definition.name.clone())),
            Entry::Vacant(slot) => Ok(slot.insert(ActiveFault::new(definition, now))),
        }
    }

    /// Record a successful apply: store the handle and restart the clock.
    ///
    /// Returns the new expiry time, or `None` if the slot is not pending.
    pub fn attach(
        &mut self,
        name: &str,
        handle: FaultHandle,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let fault = self.faults.get_mut(name)?;
        if fault.phase != FaultPhase::Pending {
            return None;
        }
        fault.started_at = now;
        fault.expires_at = expiry(&fault.definition, now);
        fault.phase = FaultPhase::Active;
        fault.handle = Some(handle);
        Some(fault.expires_at)
    }

    /// Move an active fault to `Reverting` and hand out its handle.
    ///
    /// Only the first caller gets the handle; later callers (and callers for
    /// pending or unknown names) get `None`.
    pub fn begin_revert(&mut self, name: &str) -> Option<(Arc<FaultDefinition>, FaultHandle)> {
        let fault = self.faults.get_mut(name)?;
        if fault.phase != FaultPhase::Active {
            return None;
        }
        let handle = fault.handle.take()?;
        fault.phase = FaultPhase::Reverting;
        Some((Arc::clone(&fault.definition), handle))
    }

    /// Release the slot
    pub fn deactivate(&mut self, name: &str) -> Option<ActiveFault> {
        self.faults.remove(name)
    }

    /// Look up a slot
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ActiveFault> {
        self.faults.get(name)
    }

    /// Names in the given phase
    #[must_use]
    pub fn names_in(&self, phase: FaultPhase) -> Vec<String> {
        self.faults
            .iter()
            .filter(|(_, f)| f.phase == phase)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of occupied slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    /// Whether no slot is occupied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::catalog::{FaultType, Severity};

    fn def(name: &str, duration_seconds: u64) -> Arc<FaultDefinition> {
        Arc::new(FaultDefinition {
            name: name.to_string(),
            fault_type: FaultType::Cpu,
            severity: Severity::Low,
            duration_seconds,
            probability: 1.0,
            parameters: BTreeMap::new(),
            slo_impact: Vec::new(),
        })
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn activate_twice_is_rejected() {
        let mut registry = ActiveFaultRegistry::new();
        registry.activate(def("cpu", 5), t(0)).unwrap();
        let err = registry.activate(def("cpu", 5), t(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyActive(name) if name == "cpu"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn attach_restarts_expiry_from_apply_completion() {
        let mut registry = ActiveFaultRegistry::new();
        registry.activate(def("cpu", 5), t(0)).unwrap();
        let expires = registry.attach("cpu", FaultHandle::Token(1), t(2)).unwrap();
        assert_eq!(expires, t(7));
        assert_eq!(registry.get("cpu").unwrap().phase(), FaultPhase::Active);
    }

    #[test]
    fn handle_is_handed_out_exactly_once() {
        let mut registry = ActiveFaultRegistry::new();
        registry.activate(def("cpu", 5), t(0)).unwrap();
        registry.attach("cpu", FaultHandle::Token(9), t(0));

        let (definition, handle) = registry.begin_revert("cpu").unwrap();
        assert_eq!(definition.name, "cpu");
        assert!(matches!(handle, FaultHandle::Token(9)));
        assert!(registry.begin_revert("cpu").is_none());

        // Slot stays occupied until the revert finished.
        assert!(registry.is_active("cpu"));
        assert!(registry.deactivate("cpu").is_some());
        assert!(!registry.is_active("cpu"));
    }

    #[test]
    fn pending_slots_cannot_be_reverted() {
        let mut registry = ActiveFaultRegistry::new();
        registry.activate(def("net", 5), t(0)).unwrap();
        assert!(registry.begin_revert("net").is_none());
        assert_eq!(registry.names_in(FaultPhase::Pending), ["net"]);
    }
}
