//! Workload registry
//!
//! Tracks the pods scheduled on this node, their workload class and the
//! containers inside them. The pod event consumer ([`watch`]) is the only
//! writer; the control loops read consistent snapshots.
//!
//! All state sits behind one reader-writer lock. Every mutation is applied
//! within a single write-lock section, so a snapshot taken under the read
//! lock never observes a half-applied add, modify or delete.

pub mod watch;


pub use watch::{handle_event, run_pod_watch, EventOutcome, WatchError};

use crate::actuator::cpu::{QuotaBounds, CPU_PERIOD_US};
use crate::models::{CpuSettings, PodObject, WorkloadClass};
use crate::runtime::{ContainerRuntime, CpuUpdate};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry contract violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pod {0} is already tracked")]
    DuplicatePod(String),

    #[error("pod {0} is not tracked")]
    UnknownPod(String),
}

/// A running container inside a tracked pod
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub pod_key: String,
    pub ip: Option<String>,
    pub cpu: CpuSettings,
    /// Last observed host-wide CPU percent
    pub cpu_percent: f64,
}

impl Container {
    pub fn new(id: &str, name: &str, pod_key: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            pod_key: pod_key.to_string(),
            ip: None,
            cpu: CpuSettings::default(),
            cpu_percent: 0.0,
        }
    }
}

/// A tracked pod
#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// QoS class as reported by the orchestrator
    pub qos_class: Option<String>,
    pub class: WorkloadClass,
    pub ip: Option<String>,
    pub containers: BTreeMap<String, Container>,
}

impl Pod {
    fn from_object(object: &PodObject) -> Self {
        Self {
            name: object.name.clone(),
            namespace: object.namespace.clone(),
            uid: object.uid.clone(),
            qos_class: object.qos_class.clone(),
            class: object.workload_class(),
            ip: object.pod_ip.clone(),
            containers: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_best_effort(&self) -> bool {
        self.class.is_best_effort()
    }
}

/// Result of reconciling a pod's containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifyOutcome {
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct QosApp {
    pod_key: String,
    name: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    pods: HashMap<String, Pod>,
    hp_pods: usize,
    be_pods: usize,
    qos_app: Option<QosApp>,
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Pods ordered by key
    pub pods: Vec<Pod>,
    pub hp_pods: usize,
    pub be_pods: usize,
    pub qos_app: Option<String>,
}

impl RegistrySnapshot {
    pub fn be_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| p.is_best_effort())
    }

    pub fn hp_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| !p.is_best_effort())
    }

    pub fn be_containers(&self) -> impl Iterator<Item = (&Pod, &Container)> {
        self.be_pods()
            .flat_map(|pod| pod.containers.values().map(move |c| (pod, c)))
    }

    pub fn containers(&self) -> impl Iterator<Item = (&Pod, &Container)> {
        self.pods
            .iter()
            .flat_map(|pod| pod.containers.values().map(move |c| (pod, c)))
    }

    pub fn has_be_pods(&self) -> bool {
        self.be_pods > 0
    }

    /// IP addresses of BE pods that have at least one container
    pub fn be_ips(&self) -> BTreeSet<String> {
        self.be_pods()
            .filter(|p| !p.containers.is_empty())
            .filter_map(|p| p.ip.clone())
            .filter(|ip| !ip.is_empty())
            .collect()
    }
}

/// Concurrent map of active pods on this node
#[derive(Debug, Default)]
pub struct WorkloadRegistry {
    state: RwLock<RegistryState>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a pod. A duplicate leaves the tracked pod untouched.
    pub async fn add_pod(&self, key: &str, object: &PodObject) -> Result<(), RegistryError> {
        let pod = Pod::from_object(object);

        if pod.is_best_effort() && pod.qos_class.as_deref() != Some("BestEffort") {
            if let Some(qos) = pod.qos_class.as_deref() {
                warn!(
                    subsystem = "registry",
                    pod = %key,
                    qos_class = %qos,
                    "BE pod is not in the BestEffort QoS class"
                );
            }
        }

        let mut state = self.state.write().await;
        if state.pods.contains_key(key) {
            warn!(subsystem = "registry", pod = %key, "Duplicate add for tracked pod");
            return Err(RegistryError::DuplicatePod(key.to_string()));
        }

        match pod.class {
            WorkloadClass::BestEffort => state.be_pods += 1,
            WorkloadClass::HighPriority => state.hp_pods += 1,
        }
        info!(pod = %key, class = %pod.class, "Tracking pod");
        state.pods.insert(key.to_string(), pod);
        Ok(())
    }

    /// Reconcile a tracked pod's containers against the event's container ids.
    ///
    /// New containers are resolved through the runtime outside the lock. When
    /// `clamp` is given and the pod is BE, each new container gets the
    /// canonical period and a quota inside the bounds (one-time admission
    /// clamp). All additions and removals are then applied in one write.
    pub async fn modify_pod(
        &self,
        key: &str,
        object: &PodObject,
        runtime: &dyn ContainerRuntime,
        clamp: Option<QuotaBounds>,
    ) -> Result<ModifyOutcome, RegistryError> {
        let (tracked, class) = {
            let state = self.state.read().await;
            let pod = state
                .pods
                .get(key)
                .ok_or_else(|| RegistryError::UnknownPod(key.to_string()))?;
            let tracked: BTreeSet<String> = pod.containers.keys().cloned().collect();
            (tracked, pod.class)
        };

        let observed: BTreeSet<String> = object.runtime_ids().map(String::from).collect();
        let mut outcome = ModifyOutcome::default();
        let mut resolved = Vec::new();

        for id in observed.difference(&tracked) {
            let details = match runtime.inspect(id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(
                        subsystem = "registry",
                        pod = %key,
                        container_id = %id,
                        error = %e,
                        "Cannot resolve container, skipping"
                    );
                    outcome.skipped += 1;
                    continue;
                }
            };

            let mut cpu = details.cpu;
            if let (WorkloadClass::BestEffort, Some(bounds)) = (class, clamp) {
                cpu = admit(runtime, id, cpu, bounds).await;
            }

            resolved.push(Container {
                id: id.clone(),
                name: details.name,
                pod_key: key.to_string(),
                ip: object.pod_ip.clone(),
                cpu,
                cpu_percent: 0.0,
            });
        }

        let stale: Vec<&String> = tracked.difference(&observed).collect();

        let mut state = self.state.write().await;
        let pod = state
            .pods
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownPod(key.to_string()))?;

        if object.pod_ip.is_some() {
            pod.ip = object.pod_ip.clone();
            for container in pod.containers.values_mut() {
                container.ip = object.pod_ip.clone();
            }
        }
        if object.qos_class.is_some() {
            pod.qos_class = object.qos_class.clone();
        }

        for container in resolved {
            debug!(pod = %key, container_id = %container.id, "Container added");
            pod.containers.insert(container.id.clone(), container);
            outcome.added += 1;
        }
        for id in stale {
            debug!(pod = %key, container_id = %id, "Container removed");
            pod.containers.remove(id);
            outcome.removed += 1;
        }

        Ok(outcome)
    }

    /// Stop tracking a pod
    pub async fn delete_pod(&self, key: &str) -> Result<Pod, RegistryError> {
        let mut state = self.state.write().await;
        let mut pod = state
            .pods
            .remove(key)
            .ok_or_else(|| RegistryError::UnknownPod(key.to_string()))?;

        match pod.class {
            WorkloadClass::BestEffort => state.be_pods = state.be_pods.saturating_sub(1),
            WorkloadClass::HighPriority => state.hp_pods = state.hp_pods.saturating_sub(1),
        }
        info!(pod = %key, class = %pod.class, "Stopped tracking pod");
        pod.containers.clear();
        Ok(pod)
    }

    /// Claim the QoS application slot. The first claimant keeps it.
    pub async fn set_qos_app(&self, pod_key: &str, name: &str) -> bool {
        let mut state = self.state.write().await;
        match &state.qos_app {
            Some(current) if current.pod_key == pod_key => {
                if current.name != name {
                    state.qos_app = Some(QosApp {
                        pod_key: pod_key.to_string(),
                        name: name.to_string(),
                    });
                }
                true
            }
            Some(current) => {
                warn!(
                    subsystem = "registry",
                    current = %current.name,
                    candidate = %name,
                    "More than one QoS application labelled, keeping the first"
                );
                false
            }
            None => {
                info!(app = %name, pod = %pod_key, "QoS application set");
                state.qos_app = Some(QosApp {
                    pod_key: pod_key.to_string(),
                    name: name.to_string(),
                });
                true
            }
        }
    }

    /// Release the QoS application slot if this pod holds it
    pub async fn clear_qos_app(&self, pod_key: &str) -> bool {
        let mut state = self.state.write().await;
        if state.qos_app.as_ref().is_some_and(|app| app.pod_key == pod_key) {
            info!(pod = %pod_key, "QoS application cleared");
            state.qos_app = None;
            true
        } else {
            false
        }
    }

    pub async fn qos_app(&self) -> Option<String> {
        self.state.read().await.qos_app.as_ref().map(|app| app.name.clone())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.read().await.pods.contains_key(key)
    }

    /// (HP, BE) pod counts
    pub async fn pod_counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.hp_pods, state.be_pods)
    }

    /// Copy the whole registry under the read lock
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        let mut pods: Vec<Pod> = state.pods.values().cloned().collect();
        pods.sort_by_key(|p| p.key());

        RegistrySnapshot {
            pods,
            hp_pods: state.hp_pods,
            be_pods: state.be_pods,
            qos_app: state.qos_app.as_ref().map(|app| app.name.clone()),
        }
    }

    /// Record CPU settings written to a container
    pub async fn set_container_cpu(&self, pod_key: &str, container_id: &str, cpu: CpuSettings) {
        let mut state = self.state.write().await;
        if let Some(container) = state
            .pods
            .get_mut(pod_key)
            .and_then(|pod| pod.containers.get_mut(container_id))
        {
            container.cpu = cpu;
        }
    }

    /// Record last observed CPU percent for a batch of containers
    pub async fn set_cpu_percents(&self, samples: &[(String, String, f64)]) {
        let mut state = self.state.write().await;
        for (pod_key, container_id, percent) in samples {
            if let Some(container) = state
                .pods
                .get_mut(pod_key)
                .and_then(|pod| pod.containers.get_mut(container_id))
            {
                container.cpu_percent = *percent;
            }
        }
    }
}

/// Apply the admission clamp to a newly observed BE container
async fn admit(
    runtime: &dyn ContainerRuntime,
    id: &str,
    current: CpuSettings,
    bounds: QuotaBounds,
) -> CpuSettings {
    let mut target = current;
    let mut update = CpuUpdate::default();

    if current.period != CPU_PERIOD_US {
        target.period = CPU_PERIOD_US;
        update.period = Some(CPU_PERIOD_US);
    }
    if !bounds.contains(current.quota) {
        target.quota = bounds.min;
        update.quota = Some(bounds.min);
    }

    if update == CpuUpdate::default() {
        return current;
    }

    match runtime.update_cpu(id, update).await {
        Ok(()) => {
            debug!(
                container_id = %id,
                period = target.period,
                quota = target.quota,
                "Admission clamp applied"
            );
            target
        }
        Err(e) => {
            warn!(
                subsystem = "registry",
                container_id = %id,
                error = %e,
                "Admission clamp failed"
            );
            current
        }
    }
}
