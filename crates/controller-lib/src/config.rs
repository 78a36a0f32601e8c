//! Controller configuration
//!
//! Loaded once at startup from a JSON document keyed by controller name
//! (`quota_controller`, `net_controller`, `blkio_controller`) plus a few
//! top-level keys. Environment variables prefixed with `BE_CONTROLLER__`
//! override file values, using `__` as the nesting separator
//! (e.g. `BE_CONTROLLER__QUOTA_CONTROLLER__PERIOD=10`).

use crate::command::{BlockDevice, Interface};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {0}")]
    Missing(PathBuf),

    #[error("malformed configuration: {0}")]
    Malformed(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the controller learns about workloads and acts on them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    /// Pods come from the Kubernetes watch stream
    #[default]
    K8s,
    /// Containers come straight from the container runtime
    Docker,
}

/// Top-level controller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: ModeKind,

    /// Command execution location: `in` uses the unix socket transport,
    /// anything else runs commands as local subprocesses
    pub ctlloc: String,

    /// Unix socket of the command execution service
    pub command_socket: PathBuf,

    /// Emit per-cycle records to the metrics sink
    pub write_metrics: bool,

    /// Port for the health and metrics endpoint
    pub api_port: u16,

    /// QoS data store providing slack and the global switch
    pub qos_data_store_url: String,

    /// Kubelet read-only port for node CPU statistics
    pub kubelet_stats_port: u16,

    /// Server-side watch timeout; unset leaves it to the API server
    pub watch_timeout_secs: Option<u32>,

    /// Container list polling interval when running without an orchestrator
    pub runtime_poll_secs: u64,

    pub influx: InfluxConfig,
    pub quota_controller: QuotaControllerConfig,
    pub net_controller: NetControllerConfig,
    pub blkio_controller: BlkioControllerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ModeKind::K8s,
            ctlloc: "in".to_string(),
            command_socket: PathBuf::from("/var/run/command.sock"),
            write_metrics: false,
            api_port: 8080,
            qos_data_store_url: "http://qos-data-store:7781".to_string(),
            kubelet_stats_port: 10255,
            watch_timeout_secs: None,
            runtime_poll_secs: 2,
            influx: InfluxConfig::default(),
            quota_controller: QuotaControllerConfig::default(),
            net_controller: NetControllerConfig::default(),
            blkio_controller: BlkioControllerConfig::default(),
        }
    }
}

/// InfluxDB metrics sink settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://influxsrv:8086".to_string(),
            database: "be_controller".to_string(),
        }
    }
}

/// CPU quota controller settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaControllerConfig {
    /// Cycle period in seconds
    pub period: u64,
    pub disabled: bool,
    /// Minimum BE quota as a fraction of node CPUs
    pub min_be_quota: f64,
    /// Maximum BE quota as a fraction of node CPUs
    pub max_be_quota: f64,
    #[serde(alias = "BE_growth_ratio")]
    pub be_growth_ratio: f64,
    #[serde(alias = "BE_shrink_ratio")]
    pub be_shrink_ratio: f64,
    pub slack_threshold_disable: f64,
    pub slack_threshold_reset: f64,
    pub slack_threshold_shrink: f64,
    pub slack_threshold_grow: f64,
    /// Node CPU utilization (percent) above which BE shrinks
    pub load_threshold_shrink: f64,
    /// Node CPU utilization (percent) below which BE may grow
    pub load_threshold_grow: f64,
}

impl Default for QuotaControllerConfig {
    fn default() -> Self {
        Self {
            period: 5,
            disabled: false,
            min_be_quota: 0.2,
            max_be_quota: 0.5,
            be_growth_ratio: 0.1,
            be_shrink_ratio: 0.1,
            slack_threshold_disable: -0.2,
            slack_threshold_reset: 0.0,
            slack_threshold_shrink: 0.1,
            slack_threshold_grow: 0.2,
            load_threshold_shrink: 90.0,
            load_threshold_grow: 75.0,
        }
    }
}

impl QuotaControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
}

/// Network bandwidth controller settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetControllerConfig {
    pub period: u64,
    pub disabled: bool,
    /// External (egress) interface
    pub iface_ext: String,
    /// Container-facing (ingress) interface
    pub iface_cont: String,
    /// Maximum bandwidth BE may ever use
    pub max_bw_mbps: f64,
    /// Physical link bandwidth
    pub link_bw_mbps: f64,
    /// Floor for the BE allocation and initial ingress limit
    pub default_limit_mbps: f64,
}

impl Default for NetControllerConfig {
    fn default() -> Self {
        Self {
            period: 5,
            disabled: false,
            iface_ext: "eth0".to_string(),
            iface_cont: "docker0".to_string(),
            max_bw_mbps: 1000.0,
            link_bw_mbps: 10000.0,
            default_limit_mbps: 50.0,
        }
    }
}

impl NetControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
}

/// Block I/O controller settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlkioControllerConfig {
    pub period: u64,
    pub disabled: bool,
    /// Throttled block device as `major:minor`
    pub block_dev: String,
    pub max_rd_iops: u64,
    pub max_wr_iops: u64,
    /// Root of the blkio cgroup hierarchy
    pub cgroup_root: PathBuf,
}

impl Default for BlkioControllerConfig {
    fn default() -> Self {
        Self {
            period: 5,
            disabled: false,
            block_dev: "8:0".to_string(),
            max_rd_iops: 1000,
            max_wr_iops: 1000,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/blkio"),
        }
    }
}

impl BlkioControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
}

impl ControllerConfig {
    /// Load configuration from a JSON file with environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }

        let source = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix("BE_CONTROLLER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let parsed: Self = source.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse configuration from a JSON string (no environment overrides)
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()?;

        let parsed: Self = source.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// True when commands go through the unix socket transport
    pub fn uses_command_socket(&self) -> bool {
        self.ctlloc == "in"
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quota_controller;
        let n = &self.net_controller;
        let b = &self.blkio_controller;

        if q.period == 0 || n.period == 0 || b.period == 0 {
            return Err(ConfigError::Invalid("controller periods must be positive".into()));
        }
        if !(q.min_be_quota > 0.0 && q.min_be_quota <= q.max_be_quota && q.max_be_quota <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "BE quota fractions must satisfy 0 < min ({}) <= max ({}) <= 1",
                q.min_be_quota, q.max_be_quota
            )));
        }
        if !(q.slack_threshold_disable <= q.slack_threshold_reset
            && q.slack_threshold_reset <= q.slack_threshold_shrink
            && q.slack_threshold_shrink <= q.slack_threshold_grow)
        {
            return Err(ConfigError::Invalid(
                "slack thresholds must be ordered disable <= reset <= shrink <= grow".into(),
            ));
        }
        if n.max_bw_mbps <= 0.0 || n.link_bw_mbps <= 0.0 || n.default_limit_mbps <= 0.0 {
            return Err(ConfigError::Invalid("bandwidth settings must be positive".into()));
        }
        if b.max_rd_iops == 0 || b.max_wr_iops == 0 {
            return Err(ConfigError::Invalid("maximum IOPS must be positive".into()));
        }

        Interface::new(&n.iface_ext).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Interface::new(&n.iface_cont).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        BlockDevice::parse(&b.block_dev).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(())
    }
}
