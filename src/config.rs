//! Configuration management

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::LazyLock;
use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{FaultCatalog, FaultDefinition};
use crate::slo::SloGate;
use crate::{Error, Result};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Main configuration: one chaos run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Run length in minutes
    pub duration_minutes: u64,
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Faults that may be injected
    pub faults: Vec<FaultDefinition>,
    /// Gates evaluated against live metrics
    pub slo_gates: Vec<SloGate>,
    /// Loop timing
    pub schedule: ScheduleConfig,
    /// Backpressure timing
    #[serde(alias = "backpressure_config")]
    pub backpressure: BackpressureConfig,
    /// Load generator process
    #[serde(alias = "k6_config")]
    pub load_generator: LoadGeneratorConfig,
    /// Where gate metrics are read from
    pub metrics: MetricsConfig,
    /// Where the engine's own metrics are exposed
    pub telemetry: TelemetryConfig,
    /// Fault applier tooling
    pub appliers: ApplierConfig,
    /// Result files
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "chaos-run".to_string(),
            description: String::new(),
            duration_minutes: 10,
            env_files: Vec::new(),
            faults: Vec::new(),
            slo_gates: Vec::new(),
            schedule: ScheduleConfig::default(),
            backpressure: BackpressureConfig::default(),
            load_generator: LoadGeneratorConfig::default(),
            metrics: MetricsConfig::default(),
            telemetry: TelemetryConfig::default(),
            appliers: ApplierConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (CHAOS_GATE_ prefix)
        figment = figment.merge(Env::prefixed("CHAOS_GATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let re = &*ENV_VAR_PATTERN;

        self.metrics.prometheus_url = expand_string(re, &self.metrics.prometheus_url);
        self.load_generator.command = expand_string(re, &self.load_generator.command);
        self.load_generator.script = expand_string(re, &self.load_generator.script);
        for arg in &mut self.load_generator.extra_args {
            *arg = expand_string(re, arg);
        }
        self.output.results_dir = expand_string(re, &self.output.results_dir);

        for fault in &mut self.faults {
            for value in fault.parameters.values_mut() {
                if let Value::String(s) = value {
                    *s = expand_string(re, s);
                }
            }
        }
    }

    /// Validate everything and build the fault catalog.
    ///
    /// Any failure is an [`Error::Config`]; the run must not start.
    pub fn validate(&self) -> Result<FaultCatalog> {
        if self.duration_minutes == 0 {
            return Err(Error::Config("duration_minutes must be greater than zero".to_string()));
        }

        let catalog = FaultCatalog::register(self.faults.iter().cloned())?;

        let mut gate_names = HashSet::new();
        for gate in &self.slo_gates {
            gate.validate()?;
            if !gate_names.insert(gate.name.as_str()) {
                return Err(Error::Config(format!("duplicate gate name '{}'", gate.name)));
            }
        }

        for (label, interval) in [
            ("schedule.injection_interval", self.schedule.injection_interval),
            ("schedule.evaluation_interval", self.schedule.evaluation_interval),
            ("schedule.applier_timeout", self.schedule.applier_timeout),
            ("backpressure.cooldown", self.backpressure.cooldown),
            ("backpressure.lookback", self.backpressure.lookback),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{label} must be greater than zero")));
            }
        }

        let lg = &self.load_generator;
        if lg.enabled {
            if lg.script.trim().is_empty() {
                return Err(Error::Config(
                    "load_generator.script is required when the load generator is enabled"
                        .to_string(),
                ));
            }
            if lg.vus == 0 {
                return Err(Error::Config("load_generator.vus must be greater than zero".to_string()));
            }
            if lg.reduced_vus > lg.vus {
                tracing::warn!(
                    vus = lg.vus,
                    reduced_vus = lg.reduced_vus,
                    "reduced_vus exceeds vus; backpressure will increase load"
                );
            }
        }

        Ok(catalog)
    }

    /// Configured run length
    #[must_use]
    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.duration_minutes.saturating_mul(60))
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Injection scheduler tick
    #[serde(with = "humantime_serde")]
    pub injection_interval: Duration,
    /// SLO evaluator tick
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Bound on each applier apply/revert call
    #[serde(with = "humantime_serde")]
    pub applier_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            injection_interval: Duration::from_secs(30),
            evaluation_interval: Duration::from_secs(10),
            applier_timeout: Duration::from_secs(30),
        }
    }
}

/// Backpressure timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Wait between stabilization checks
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// A check passes when no violation is younger than this
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            lookback: Duration::from_secs(300),
        }
    }
}

/// Load generator (k6) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadGeneratorConfig {
    /// Start and steer a load generator
    pub enabled: bool,
    /// k6 binary
    pub command: String,
    /// Script passed to `k6 run`
    pub script: String,
    /// VUs at normal rate
    pub vus: u32,
    /// VUs while backpressure is active
    pub reduced_vus: u32,
    /// k6 REST API address (`--address`)
    pub api_address: String,
    /// Extra arguments before the script path
    pub extra_args: Vec<String>,
    /// Grace period before k6 is killed on stop
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Timeout for each REST API request
    #[serde(with = "humantime_serde")]
    pub control_timeout: Duration,
    /// How often the orchestrator checks whether k6 finished
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LoadGeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "k6".to_string(),
            script: String::new(),
            vus: 50,
            reduced_vus: 10,
            api_address: "127.0.0.1:6565".to_string(),
            extra_args: Vec::new(),
            stop_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Built-in PromQL templates; `{window}` is replaced with the gate window
pub const BUILTIN_QUERIES: &[(&str, &str)] = &[
    (
        "response_time_p95",
        "histogram_quantile(0.95, rate(http_request_duration_seconds_bucket[{window}]))",
    ),
    (
        "error_rate",
        "rate(http_requests_total{status=~\"5..\"}[{window}]) / rate(http_requests_total[{window}])",
    ),
];

/// Metrics source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus base URL
    pub prometheus_url: String,
    /// Per-query HTTP timeout
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Extra or overriding metric templates, keyed by gate metric
    pub queries: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            query_timeout: Duration::from_secs(5),
            queries: BTreeMap::new(),
        }
    }
}

impl MetricsConfig {
    /// Built-in templates overlaid with configured ones
    #[must_use]
    pub fn query_templates(&self) -> BTreeMap<String, String> {
        let mut templates: BTreeMap<String, String> = BUILTIN_QUERIES
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        templates.extend(self.queries.clone());
        templates
    }
}

/// Engine metrics exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Serve metrics over HTTP
    pub exporter_enabled: bool,
    /// Listen address for the exporter
    pub exporter_listen: SocketAddr,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            exporter_enabled: true,
            exporter_listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8001)),
        }
    }
}

/// Tools used by the built-in fault appliers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// Stress tool for cpu/memory/disk-io faults
    pub stress_program: String,
    /// Traffic control binary for network-loss faults
    pub tc_program: String,
    /// Interface for network-loss faults without an `interface` parameter
    pub network_interface: String,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            stress_program: "stress-ng".to_string(),
            tc_program: "tc".to_string(),
            network_interface: "lo".to_string(),
        }
    }
}

/// Result file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for `chaos_test_<id>.json`
    pub results_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: "results".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string ("250ms" or "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string ("30s", "5m", "100ms") or bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
