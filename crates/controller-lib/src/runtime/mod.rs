//! Container runtime collaborator
//!
//! Reads container CPU settings and statistics, mutates CPU period/quota,
//! and kills containers. The production implementation talks to the Docker
//! engine API; tests use an in-memory runtime.

mod docker;

pub use docker::DockerRuntime;

use crate::models::CpuSettings;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from the container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("container runtime API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("runtime response for {id} is missing {field}")]
    Incomplete { id: String, field: &'static str },
}

/// Identity and CPU settings of a running container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub cpu: CpuSettings,
}

/// Summary of a running container, used when no orchestrator is present
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ip_address: Option<String>,
}

/// CPU bandwidth update; unset fields are left untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuUpdate {
    pub period: Option<i64>,
    pub quota: Option<i64>,
}

/// Operations the controller needs from the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a container id to its name and current CPU settings
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Change CPU period and/or quota
    async fn update_cpu(&self, id: &str, update: CpuUpdate) -> Result<(), RuntimeError>;

    /// Kill a container
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Host-wide CPU percent used by the container since the previous sample
    async fn cpu_percent(&self, id: &str) -> Result<f64, RuntimeError>;

    /// Number of CPUs on the host
    async fn host_cpu_count(&self) -> Result<u32, RuntimeError>;

    /// Host name as seen by the runtime
    async fn host_name(&self) -> Result<String, RuntimeError>;

    /// Running containers
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, RuntimeError>;
}

/// CPU percent from cumulative container and system usage counters
pub fn cpu_percent_from_deltas(
    cpu_total: u64,
    pre_cpu_total: u64,
    system_total: u64,
    pre_system_total: u64,
) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(pre_cpu_total) as f64;
    let system_delta = system_total.saturating_sub(pre_system_total) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        cpu_delta / system_delta * 100.0
    } else {
        0.0
    }
}
