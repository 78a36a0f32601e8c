//! Docker engine implementation of the runtime collaborator

use super::{
    cpu_percent_from_deltas, ContainerDetails, ContainerRuntime, CpuUpdate, RuntimeContainer,
    RuntimeError,
};
use crate::models::CpuSettings;
use async_trait::async_trait;
use bollard::{
    container::{
        InspectContainerOptions, KillContainerOptions, ListContainersOptions, StatsOptions,
        UpdateContainerOptions,
    },
    errors::Error,
    Docker,
};
use tokio_stream::StreamExt;
use tracing::debug;

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_defaults()?;
        // Fail at startup rather than on the first control cycle.
        docker.ping().await?;
        debug!("Docker API initialized");
        Ok(Self { docker })
    }
}

fn map_not_found(id: &str, err: Error) -> RuntimeError {
    match err {
        Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        other => RuntimeError::Api(other),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))?;

        let host_config = response.host_config.ok_or_else(|| RuntimeError::Incomplete {
            id: id.to_string(),
            field: "HostConfig",
        })?;

        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            cpu: CpuSettings {
                period: host_config.cpu_period.unwrap_or(0),
                quota: host_config.cpu_quota.unwrap_or(0),
            },
        })
    }

    async fn update_cpu(&self, id: &str, update: CpuUpdate) -> Result<(), RuntimeError> {
        let options = UpdateContainerOptions::<String> {
            cpu_period: update.period,
            cpu_quota: update.quota,
            ..Default::default()
        };
        self.docker
            .update_container(id, options)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn cpu_percent(&self, id: &str) -> Result<f64, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stats = Box::pin(self.docker.stats(id, Some(options)));

        let sample = match stats.next().await {
            Some(sample) => sample.map_err(|e| map_not_found(id, e))?,
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };

        Ok(cpu_percent_from_deltas(
            sample.cpu_stats.cpu_usage.total_usage,
            sample.precpu_stats.cpu_usage.total_usage,
            sample.cpu_stats.system_cpu_usage.unwrap_or(0),
            sample.precpu_stats.system_cpu_usage.unwrap_or(0),
        ))
    }

    async fn host_cpu_count(&self) -> Result<u32, RuntimeError> {
        let info = self.docker.info().await?;
        info.ncpu
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| RuntimeError::Incomplete {
                id: "host".to_string(),
                field: "NCPU",
            })
    }

    async fn host_name(&self) -> Result<String, RuntimeError> {
        let info = self.docker.info().await?;
        info.name.ok_or_else(|| RuntimeError::Incomplete {
            id: "host".to_string(),
            field: "Name",
        })
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;

        let containers = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let ip_address = summary
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .and_then(|networks| {
                        networks
                            .into_values()
                            .filter_map(|endpoint| endpoint.ip_address)
                            .find(|ip| !ip.is_empty())
                    });

                Some(RuntimeContainer {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    ip_address,
                })
            })
            .collect();

        Ok(containers)
    }
}
