//! Orchestration collaborator and cluster-mode strategy
//!
//! The controller runs in one of two modes, selected once at startup:
//! - [`ClusterMode::Orchestrated`]: pods come from the Kubernetes watch
//!   stream, BE work is stopped by deleting pods, and admission of new BE
//!   work is toggled with a node label
//! - [`ClusterMode::RuntimeOnly`]: pod events are synthesized from the
//!   container runtime, BE work is stopped by killing containers, and there
//!   is no scheduler to steer

mod kubernetes;
mod standalone;

pub use kubernetes::{parse_cpu_quantity, KubeOrchestrator};
pub use standalone::RuntimeEventSource;

use crate::models::{PodEvent, BE_ENABLED_LABEL};
use crate::registry::Pod;
use crate::runtime::{ContainerRuntime, RuntimeError};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::Stream;
use tracing::{debug, info};

/// Errors from the orchestration layer
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("watch rejected by the API server ({code}): {message}")]
    WatchRejected { code: u16, message: String },

    #[error("node {0} does not report a CPU capacity")]
    MissingCapacity(String),

    #[error("cannot parse CPU quantity {0:?}")]
    InvalidQuantity(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Live stream of pod lifecycle events
pub type PodEventStream = Pin<Box<dyn Stream<Item = Result<PodEvent, OrchestratorError>> + Send>>;

/// Operations the controller needs from the orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Subscribe to pod events across all namespaces
    async fn watch_pods(&self) -> Result<PodEventStream, OrchestratorError>;

    /// CPU core capacity of a node
    async fn node_cpu_count(&self, node: &str) -> Result<u32, OrchestratorError>;

    /// Delete a pod immediately, orphaning its dependents
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;

    /// Set a label on a node
    async fn label_node(&self, node: &str, key: &str, value: &str)
        -> Result<(), OrchestratorError>;
}

/// How workloads are discovered and acted upon
#[derive(Clone)]
pub enum ClusterMode {
    RuntimeOnly,
    Orchestrated { orchestrator: Arc<dyn Orchestrator> },
}

impl ClusterMode {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMode::RuntimeOnly => "runtime-only",
            ClusterMode::Orchestrated { .. } => "orchestrated",
        }
    }

    /// Open the pod event stream for this mode
    pub async fn watch(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        node_name: &str,
        poll_interval: Duration,
    ) -> Result<PodEventStream, OrchestratorError> {
        match self {
            ClusterMode::Orchestrated { orchestrator } => orchestrator.watch_pods().await,
            ClusterMode::RuntimeOnly => {
                Ok(RuntimeEventSource::new(runtime, node_name, poll_interval).into_stream())
            }
        }
    }

    /// Forcibly stop a BE pod
    pub async fn stop_workload(
        &self,
        runtime: &dyn ContainerRuntime,
        pod: &Pod,
    ) -> Result<(), OrchestratorError> {
        match self {
            ClusterMode::Orchestrated { orchestrator } => {
                info!(pod = %pod.key(), "Deleting BE pod");
                orchestrator.delete_pod(&pod.namespace, &pod.name).await
            }
            ClusterMode::RuntimeOnly => {
                for id in pod.containers.keys() {
                    info!(container_id = %id, "Killing BE container");
                    runtime.kill(id).await?;
                }
                Ok(())
            }
        }
    }

    /// Allow or refuse placement of new BE work on the node
    pub async fn set_be_admission(&self, node: &str, enabled: bool) -> Result<(), OrchestratorError> {
        match self {
            ClusterMode::Orchestrated { orchestrator } => {
                let value = if enabled { "true" } else { "false" };
                orchestrator.label_node(node, BE_ENABLED_LABEL, value).await
            }
            ClusterMode::RuntimeOnly => {
                debug!(enabled, "No scheduler to steer in runtime-only mode");
                Ok(())
            }
        }
    }

    /// Path fragment of a container's cgroup below the controller root
    pub fn cgroup_key(&self, pod: &Pod, container_id: &str) -> String {
        match self {
            ClusterMode::Orchestrated { .. } => {
                let qos_segment = match pod.qos_class.as_deref() {
                    Some("BestEffort") => "besteffort/",
                    Some("Burstable") => "burstable/",
                    _ => "",
                };
                format!("kubepods/{}pod{}/{}", qos_segment, pod.uid, container_id)
            }
            ClusterMode::RuntimeOnly => format!("docker/{}", container_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadClass;
    use crate::testing::{MockRuntime, RecordingOrchestrator};
    use std::collections::BTreeMap;

    fn pod(qos_class: Option<&str>) -> Pod {
        Pod {
            name: "batch".to_string(),
            namespace: "jobs".to_string(),
            uid: "1234-abcd".to_string(),
            qos_class: qos_class.map(String::from),
            class: WorkloadClass::BestEffort,
            ip: None,
            containers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_cgroup_key_per_mode() {
        let orchestrated = ClusterMode::Orchestrated {
            orchestrator: Arc::new(RecordingOrchestrator::default()),
        };

        assert_eq!(
            orchestrated.cgroup_key(&pod(Some("BestEffort")), "c1"),
            "kubepods/besteffort/pod1234-abcd/c1"
        );
        assert_eq!(
            orchestrated.cgroup_key(&pod(Some("Burstable")), "c1"),
            "kubepods/burstable/pod1234-abcd/c1"
        );
        assert_eq!(
            orchestrated.cgroup_key(&pod(Some("Guaranteed")), "c1"),
            "kubepods/pod1234-abcd/c1"
        );
        assert_eq!(ClusterMode::RuntimeOnly.cgroup_key(&pod(None), "c1"), "docker/c1");
    }

    #[tokio::test]
    async fn test_stop_workload_orchestrated_deletes_pod() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let mode = ClusterMode::Orchestrated {
            orchestrator: orchestrator.clone(),
        };
        let runtime = MockRuntime::default();

        mode.stop_workload(&runtime, &pod(None)).await.unwrap();

        assert_eq!(orchestrator.deleted(), vec!["jobs/batch".to_string()]);
        assert!(runtime.killed().is_empty());
    }

    #[tokio::test]
    async fn test_stop_workload_runtime_only_kills_containers() {
        let runtime = MockRuntime::default();
        runtime.add_container("c1", 100_000, 50_000);
        runtime.add_container("c2", 100_000, 50_000);

        let mut target = pod(None);
        for id in ["c1", "c2"] {
            target.containers.insert(
                id.to_string(),
                crate::registry::Container::new(id, id, "jobs/batch"),
            );
        }

        ClusterMode::RuntimeOnly
            .stop_workload(&runtime, &target)
            .await
            .unwrap();

        assert_eq!(runtime.killed(), vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn test_be_admission_labels_node() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let mode = ClusterMode::Orchestrated {
            orchestrator: orchestrator.clone(),
        };

        mode.set_be_admission("node-1", false).await.unwrap();
        mode.set_be_admission("node-1", true).await.unwrap();

        assert_eq!(
            orchestrator.labels(),
            vec![
                ("node-1".to_string(), BE_ENABLED_LABEL.to_string(), "false".to_string()),
                ("node-1".to_string(), BE_ENABLED_LABEL.to_string(), "true".to_string()),
            ]
        );

        assert!(ClusterMode::RuntimeOnly
            .set_be_admission("node-1", false)
            .await
            .is_ok());
    }
}
