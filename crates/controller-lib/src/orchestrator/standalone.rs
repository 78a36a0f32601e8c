//! Pod events synthesized from the container runtime
//!
//! Without an orchestrator every running container is presented as a
//! single-container pod in the `docker` namespace. The container list is
//! polled; new containers produce ADDED events and vanished ones DELETED.

use super::{OrchestratorError, PodEventStream};
use crate::models::{ContainerStatus, PodEvent, PodEventKind, PodObject};
use crate::runtime::{ContainerRuntime, RuntimeContainer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Namespace given to runtime-only pods
pub const RUNTIME_NAMESPACE: &str = "docker";

const EVENT_BUFFER: usize = 256;

/// Polls the runtime and turns container list changes into pod events
pub struct RuntimeEventSource {
    runtime: Arc<dyn ContainerRuntime>,
    node_name: String,
    poll_interval: Duration,
    known: HashMap<String, PodObject>,
}

impl RuntimeEventSource {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        node_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            node_name: node_name.into(),
            poll_interval,
            known: HashMap::new(),
        }
    }

    /// Start polling in a background task. The stream ends with an error
    /// if the runtime cannot be listed.
    pub fn into_stream(mut self) -> PodEventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let events = match self.poll().await {
                            Ok(events) => events,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        };
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = tx.closed() => {
                        debug!("Runtime event consumer went away");
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// List running containers once and diff against the previous listing
    pub async fn poll(&mut self) -> Result<Vec<PodEvent>, OrchestratorError> {
        let containers = self.runtime.list_containers().await?;
        let mut current: HashMap<String, PodObject> = containers
            .into_iter()
            .map(|c| (c.id.clone(), self.pod_object(c)))
            .collect();

        let mut events = Vec::new();

        for (id, object) in &current {
            if !self.known.contains_key(id) {
                events.push(PodEvent {
                    kind: PodEventKind::Added,
                    object: object.clone(),
                });
            }
        }

        let vanished: Vec<String> = self
            .known
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            if let Some(mut object) = self.known.remove(&id) {
                object.phase = Some("Succeeded".to_string());
                events.push(PodEvent {
                    kind: PodEventKind::Deleted,
                    object,
                });
            }
        }

        std::mem::swap(&mut self.known, &mut current);
        Ok(events)
    }

    fn pod_object(&self, container: RuntimeContainer) -> PodObject {
        PodObject {
            name: container.name.clone(),
            namespace: RUNTIME_NAMESPACE.to_string(),
            uid: container.id.clone(),
            labels: container.labels,
            node_name: Some(self.node_name.clone()),
            phase: Some("Running".to_string()),
            qos_class: None,
            pod_ip: container.ip_address,
            container_statuses: vec![ContainerStatus {
                name: container.name,
                container_id: Some(format!("docker://{}", container.id)),
            }],
        }
    }
}
