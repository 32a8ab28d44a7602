//! Fault catalog: immutable fault definitions loaded at run start

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Kind of fault, selecting the applier that realises it.
///
/// The set is open: any unrecognised string becomes [`FaultType::Custom`]
/// and is dispatched to whichever applier was registered under that name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FaultType {
    /// CPU saturation
    Cpu,
    /// Packet loss on a network interface
    NetworkLoss,
    /// Memory pressure
    Memory,
    /// Disk I/O saturation
    DiskIo,
    /// Anything else, handled by a custom applier
    Custom(String),
}

impl FaultType {
    /// Canonical name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cpu => "cpu",
            Self::NetworkLoss => "network-loss",
            Self::Memory => "memory",
            Self::DiskIo => "disk-io",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for FaultType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().replace('_', "-").as_str() {
            "cpu" | "cpu-hog" => Self::Cpu,
            "network-loss" | "packet-loss" => Self::NetworkLoss,
            "memory" | "memory-leak" => Self::Memory,
            "disk-io" | "disk" => Self::DiskIo,
            _ => Self::Custom(value),
        }
    }
}

impl From<FaultType> for String {
    fn from(value: FaultType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How disruptive a fault is expected to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Barely noticeable
    Low,
    /// Noticeable degradation
    Medium,
    /// Heavy degradation
    High,
    /// Outage-level
    Critical,
}

impl Severity {
    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault as configured: what to inject, how often, and for how long
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDefinition {
    /// Unique key
    pub name: String,
    /// Applier selector
    #[serde(rename = "type", alias = "fault_type")]
    pub fault_type: FaultType,
    /// Expected impact
    pub severity: Severity,
    /// How long an injected instance stays active
    pub duration_seconds: u64,
    /// Chance of injection on each scheduler tick (0.0–1.0)
    #[serde(alias = "probability_per_tick")]
    pub probability: f64,
    /// Applier-specific settings
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// SLOs this fault is expected to move (informational)
    #[serde(default, alias = "affected_slo_names")]
    pub slo_impact: Vec<String>,
}

impl FaultDefinition {
    /// Active duration as a [`Duration`]
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    /// Read an unsigned integer parameter, falling back to `default`.
    ///
    /// Accepts numbers and numeric strings; fractional values are truncated.
    #[must_use]
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        match self.parameters.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Read a string parameter
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Check the definition on its own
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("fault name must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(Error::Config(format!(
                "fault '{}': probability {} is outside [0, 1]",
                self.name, self.probability
            )));
        }
        if self.duration_seconds == 0 {
            return Err(Error::Config(format!(
                "fault '{}': duration_seconds must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Validated, immutable set of fault definitions in configuration order
#[derive(Debug, Clone, Default)]
pub struct FaultCatalog {
    definitions: Vec<Arc<FaultDefinition>>,
}

impl FaultCatalog {
    /// Load and validate definitions.
    ///
    /// Fails with [`Error::Config`] on the first invalid or duplicate entry.
    pub fn register(definitions: impl IntoIterator<Item = FaultDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut catalog = Vec::new();

        for definition in definitions {
            definition.validate()?;
            if !seen.insert(definition.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate fault name '{}'",
                    definition.name
                )));
            }
            catalog.push(Arc::new(definition));
        }

        Ok(Self {
            definitions: catalog,
        })
    }

    /// Look up a definition by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<FaultDefinition>> {
        self.definitions.iter().find(|d| d.name == name)
    }

    /// Iterate definitions in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FaultDefinition>> {
        self.definitions.iter()
    }

    /// Number of definitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
