//! Kubernetes API implementation of the orchestrator collaborator

use super::{Orchestrator, OrchestratorError, PodEventStream};
use crate::models::{ContainerStatus, PodEvent, PodEventKind, PodObject};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, Patch, PatchParams, PropagationPolicy, WatchEvent, WatchParams};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

const EVENT_BUFFER: usize = 256;

/// Orchestrator backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    watch_timeout_secs: Option<u32>,
}

impl KubeOrchestrator {
    /// Connect using in-cluster service credentials or the local kubeconfig
    pub async fn connect(watch_timeout_secs: Option<u32>) -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await?;
        info!("Kubernetes API client initialized");
        Ok(Self {
            client,
            watch_timeout_secs,
        })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn watch_pods(&self) -> Result<PodEventStream, OrchestratorError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut params = WatchParams::default();
        if let Some(timeout) = self.watch_timeout_secs {
            params = params.timeout(timeout);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        // The subscription lives in its own task so the returned stream owns
        // nothing borrowed from the API handle.
        tokio::spawn(async move {
            let stream = match pods.watch(&params, "0").await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(OrchestratorError::Api(e))).await;
                    return;
                }
            };
            let mut stream = Box::pin(stream);

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(WatchEvent::Added(pod)) => Ok(pod_event(PodEventKind::Added, pod)),
                    Ok(WatchEvent::Modified(pod)) => Ok(pod_event(PodEventKind::Modified, pod)),
                    Ok(WatchEvent::Deleted(pod)) => Ok(pod_event(PodEventKind::Deleted, pod)),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(status)) => Err(OrchestratorError::WatchRejected {
                        code: status.code,
                        message: status.message,
                    }),
                    Err(e) => Err(OrchestratorError::Api(e)),
                };

                let failed = event.is_err();
                if tx.send(event).await.is_err() || failed {
                    return;
                }
            }
            debug!("Pod watch closed by the API server");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn node_cpu_count(&self, node: &str) -> Result<u32, OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_obj = nodes.get(node).await?;

        let quantity = node_obj
            .status
            .and_then(|status| status.capacity)
            .and_then(|capacity| capacity.get("cpu").cloned())
            .ok_or_else(|| OrchestratorError::MissingCapacity(node.to_string()))?;

        parse_cpu_quantity(&quantity.0)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Orphan),
            ..Default::default()
        };
        pods.delete(name, &params).await?;
        Ok(())
    }

    async fn label_node(
        &self,
        node: &str,
        key: &str,
        value: &str,
    ) -> Result<(), OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "labels": { key: value } }
        });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %node, label = %key, value = %value, "Node label updated");
        Ok(())
    }
}

fn pod_event(kind: PodEventKind, pod: Pod) -> PodEvent {
    PodEvent {
        kind,
        object: pod_object(pod),
    }
}

/// Project a Kubernetes pod onto the fields the registry consumes
pub(crate) fn pod_object(pod: Pod) -> PodObject {
    let metadata = pod.metadata;
    let status = pod.status.unwrap_or_default();

    PodObject {
        name: metadata.name.unwrap_or_default(),
        namespace: metadata.namespace.unwrap_or_default(),
        uid: metadata.uid.unwrap_or_default(),
        labels: metadata.labels.unwrap_or_default(),
        node_name: pod.spec.and_then(|spec| spec.node_name),
        phase: status.phase,
        qos_class: status.qos_class,
        pod_ip: status.pod_ip,
        container_statuses: status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .map(|c| ContainerStatus {
                name: c.name,
                container_id: c.container_id,
            })
            .collect(),
    }
}

/// Whole CPU count from a Kubernetes quantity such as `4` or `3500m`
pub fn parse_cpu_quantity(quantity: &str) -> Result<u32, OrchestratorError> {
    let invalid = || OrchestratorError::InvalidQuantity(quantity.to_string());
    let trimmed = quantity.trim();

    let cpus = match trimmed.strip_suffix('m') {
        Some(millis) => millis.parse::<u64>().map_err(|_| invalid())? / 1000,
        None => trimmed.parse::<f64>().map_err(|_| invalid())?.floor() as u64,
    };

    match u32::try_from(cpus) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid()),
    }
}
