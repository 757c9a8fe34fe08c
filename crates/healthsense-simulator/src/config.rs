//! Configuration structs for the telemetry simulator.

use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Tenant the fleet reports under (e.g., "acme-clinic")
    pub tenant_id: String,

    /// Number of devices to simulate
    pub device_count: usize,

    /// Interval between publishes of one device
    pub interval: Duration,

    /// How long to run; `None` runs until stopped externally
    pub duration: Option<Duration>,

    /// Durable per-publish log (CSV)
    pub metrics_file: PathBuf,

    /// Period of the progress reporter
    pub report_interval: Duration,

    /// Hard deadline for a single publish call
    pub publish_timeout: Option<Duration>,

    /// How latency percentiles are computed
    pub percentiles: PercentileMode,

    /// Firmware version stamped on every sample
    pub fw_version: String,

    /// Seed for reproducible readings
    pub seed: Option<u64>,

    /// Where samples are published
    pub transport: TransportConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tenant_id: "acme-clinic".to_string(),
            device_count: 5,
            interval: Duration::from_secs(2),
            duration: None,
            metrics_file: PathBuf::from("simulator-metrics.csv"),
            report_interval: Duration::from_secs(10),
            publish_timeout: None,
            percentiles: PercentileMode::Exact,
            fw_version: "1.3.2".to_string(),
            seed: None,
            transport: TransportConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Checks the values a run cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.device_count == 0 {
            return Err(SimError::Config("device count must be at least 1".into()));
        }
        if self.interval.is_zero() {
            return Err(SimError::Config("publish interval must be positive".into()));
        }
        if self.report_interval.is_zero() {
            return Err(SimError::Config("report interval must be positive".into()));
        }
        if self.tenant_id.is_empty() || self.tenant_id.contains(&['/', '+', '#'][..]) {
            return Err(SimError::Config(format!(
                "invalid tenant id '{}'",
                self.tenant_id
            )));
        }
        if let TransportConfig::DryRun { failure_rate, .. } = &self.transport {
            if !(0.0..=1.0).contains(failure_rate) {
                return Err(SimError::Config(format!(
                    "dry-run failure rate {} is outside [0, 1]",
                    failure_rate
                )));
            }
        }
        Ok(())
    }
}

/// Transport the samples are published through.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// MQTT broker, QoS 1
    Mqtt { broker_url: String },
    /// No broker; publishes resolve after a fixed latency
    DryRun { latency: Duration, failure_rate: f64 },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Mqtt {
            broker_url: "tcp://localhost:1883".to_string(),
        }
    }
}

impl std::fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfig::Mqtt { broker_url } => write!(f, "mqtt ({})", broker_url),
            TransportConfig::DryRun { latency, failure_rate } => write!(
                f,
                "dry-run ({}ms, {:.0}% failures)",
                latency.as_millis(),
                failure_rate * 100.0
            ),
        }
    }
}

/// Latency percentile computation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentileMode {
    /// Keep every sample; sort a copy per snapshot
    #[default]
    Exact,
    /// Streaming HDR histogram with bounded memory
    Histogram,
}

impl std::fmt::Display for PercentileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PercentileMode::Exact => write!(f, "exact"),
            PercentileMode::Histogram => write!(f, "histogram"),
        }
    }
}

impl std::str::FromStr for PercentileMode {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(PercentileMode::Exact),
            "histogram" => Ok(PercentileMode::Histogram),
            _ => Err(SimError::Config(format!("unknown percentile mode: {}", s))),
        }
    }
}

/// On-disk settings (`simulator.yml`). Every key is optional.
///
/// ```yaml
/// tenant_id: acme-clinic
/// devices: 500
/// interval_ms: 1000
/// duration_secs: 120
/// broker: tcp://broker.local:1883
/// percentiles: histogram
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorSettings {
    pub tenant_id: Option<String>,
    pub devices: Option<usize>,
    pub interval_ms: Option<u64>,
    pub duration_secs: Option<u64>,
    pub metrics_file: Option<PathBuf>,
    pub report_interval_secs: Option<u64>,
    pub publish_timeout_ms: Option<u64>,
    pub percentiles: Option<PercentileMode>,
    pub fw_version: Option<String>,
    pub seed: Option<u64>,
    pub broker: Option<String>,
    pub dry_run: Option<bool>,
    pub dry_run_latency_ms: Option<u64>,
    pub dry_run_failure_rate: Option<f64>,
}

impl SimulatorSettings {
    /// Loads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Overlays `other` on top of `self`; keys set in `other` win.
    pub fn merge(self, other: SimulatorSettings) -> SimulatorSettings {
        SimulatorSettings {
            tenant_id: other.tenant_id.or(self.tenant_id),
            devices: other.devices.or(self.devices),
            interval_ms: other.interval_ms.or(self.interval_ms),
            duration_secs: other.duration_secs.or(self.duration_secs),
            metrics_file: other.metrics_file.or(self.metrics_file),
            report_interval_secs: other.report_interval_secs.or(self.report_interval_secs),
            publish_timeout_ms: other.publish_timeout_ms.or(self.publish_timeout_ms),
            percentiles: other.percentiles.or(self.percentiles),
            fw_version: other.fw_version.or(self.fw_version),
            seed: other.seed.or(self.seed),
            broker: other.broker.or(self.broker),
            dry_run: other.dry_run.or(self.dry_run),
            dry_run_latency_ms: other.dry_run_latency_ms.or(self.dry_run_latency_ms),
            dry_run_failure_rate: other.dry_run_failure_rate.or(self.dry_run_failure_rate),
        }
    }

    /// Resolves settings against the defaults and validates the result.
    /// A zero `duration_secs` means "run until stopped".
    pub fn into_config(self) -> Result<SimulatorConfig> {
        let defaults = SimulatorConfig::default();

        let transport = if self.dry_run.unwrap_or(false) {
            TransportConfig::DryRun {
                latency: Duration::from_millis(self.dry_run_latency_ms.unwrap_or(5)),
                failure_rate: self.dry_run_failure_rate.unwrap_or(0.0),
            }
        } else {
            match self.broker {
                Some(broker_url) => TransportConfig::Mqtt { broker_url },
                None => defaults.transport,
            }
        };

        let config = SimulatorConfig {
            tenant_id: self.tenant_id.unwrap_or(defaults.tenant_id),
            device_count: self.devices.unwrap_or(defaults.device_count),
            interval: self
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            duration: self
                .duration_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            metrics_file: self.metrics_file.unwrap_or(defaults.metrics_file),
            report_interval: self
                .report_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.report_interval),
            publish_timeout: self
                .publish_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            percentiles: self.percentiles.unwrap_or(defaults.percentiles),
            fw_version: self.fw_version.unwrap_or(defaults.fw_version),
            seed: self.seed,
            transport,
        };

        config.validate()?;
        Ok(config)
    }
}
