//! Core data models for the best-effort controller

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the workload class of a pod
pub const WCLASS_LABEL: &str = "hyperpilot.io/wclass";

/// Label marking the pod whose latency slack drives the controller
pub const QOS_LABEL: &str = "hyperpilot.io/qos";

/// Node label used to admit or refuse new BE work on this node
pub const BE_ENABLED_LABEL: &str = "hyperpilot.io/be-enabled";

/// Workload class of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadClass {
    /// Latency-critical, SLO-bearing
    #[serde(rename = "HP")]
    HighPriority,
    /// Best-effort, absorbs spare capacity
    #[serde(rename = "BE")]
    BestEffort,
}

impl WorkloadClass {
    /// Derive the class from pod labels. Anything but an exact `BE` is HP.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        match labels.get(WCLASS_LABEL).map(String::as_str) {
            Some("BE") => WorkloadClass::BestEffort,
            _ => WorkloadClass::HighPriority,
        }
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self, WorkloadClass::BestEffort)
    }
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadClass::HighPriority => write!(f, "HP"),
            WorkloadClass::BestEffort => write!(f, "BE"),
        }
    }
}

/// Kind of a pod lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/// Pod lifecycle event from the orchestrator watch stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    #[serde(rename = "type")]
    pub kind: PodEventKind,
    pub object: PodObject,
}

/// Status of one container as reported by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    /// Runtime id, possibly carrying a scheme prefix such as `docker://`
    pub container_id: Option<String>,
}

impl ContainerStatus {
    /// Runtime id with any `<scheme>://` prefix removed
    pub fn runtime_id(&self) -> Option<&str> {
        let raw = self.container_id.as_deref()?;
        let id = raw.split_once("://").map(|(_, id)| id).unwrap_or(raw);
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// Pod spec and status fields the controller consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodObject {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub node_name: Option<String>,
    pub phase: Option<String>,
    pub qos_class: Option<String>,
    pub pod_ip: Option<String>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodObject {
    /// Registry key: `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// True once the first container reports a runtime id
    pub fn has_containers(&self) -> bool {
        self.container_statuses
            .first()
            .and_then(|c| c.runtime_id())
            .is_some()
    }

    /// True for the Succeeded and Failed phases
    pub fn is_terminated(&self) -> bool {
        matches!(self.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }

    pub fn is_qos_tracked(&self) -> bool {
        self.labels.get(QOS_LABEL).map(String::as_str) == Some("true")
    }

    pub fn workload_class(&self) -> WorkloadClass {
        WorkloadClass::from_labels(&self.labels)
    }

    /// Runtime ids of all containers that already have one
    pub fn runtime_ids(&self) -> impl Iterator<Item = &str> {
        self.container_statuses.iter().filter_map(|c| c.runtime_id())
    }
}

/// CPU bandwidth settings of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSettings {
    pub period: i64,
    pub quota: i64,
}
