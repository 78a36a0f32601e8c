//! In-memory collaborators for unit tests

use crate::command::{CommandError, CommandRunner, ShellCommand};
use crate::config::ControllerConfig;
use crate::context::AppContext;
use crate::models::{ContainerStatus, CpuSettings, PodEvent, PodObject, QOS_LABEL, WCLASS_LABEL};
use crate::orchestrator::{ClusterMode, Orchestrator, OrchestratorError, PodEventStream};
use crate::runtime::{ContainerDetails, ContainerRuntime, CpuUpdate, RuntimeContainer, RuntimeError};
use crate::signal::{SignalError, Slack, SlackSource, UtilizationSource};
use crate::sink::{CycleRecord, MetricsSink};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// Command runner answering by command prefix. Unscripted commands succeed
/// with empty output. Every command, failed or not, is logged.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
    broken: Mutex<Vec<String>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn respond(&self, prefix: &str, output: &str) {
        let mut responses = self.responses.lock().unwrap();
        responses.retain(|(p, _)| p != prefix);
        responses.push((prefix.to_string(), output.to_string()));
    }

    pub fn fail(&self, prefix: &str) {
        self.failures.lock().unwrap().push(prefix.to_string());
    }

    /// Commands matching `prefix` fail before reaching a shell
    pub fn break_transport(&self, prefix: &str) {
        self.broken.lock().unwrap().push(prefix.to_string());
    }

    pub fn recover(&self, prefix: &str) {
        self.failures.lock().unwrap().retain(|p| p != prefix);
        self.broken.lock().unwrap().retain(|p| p != prefix);
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &ShellCommand) -> Result<String, CommandError> {
        let text = command.as_str();
        self.log.lock().unwrap().push(text.to_string());

        if self.broken.lock().unwrap().iter().any(|p| text.starts_with(p.as_str())) {
            return Err(CommandError::Io {
                command: text.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "scripted transport failure"),
            });
        }

        if self.failures.lock().unwrap().iter().any(|p| text.starts_with(p.as_str())) {
            return Err(CommandError::Failed {
                command: text.to_string(),
                exit_code: 1,
                stderr: "scripted failure".to_string(),
            });
        }

        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .rev()
            .find(|(p, _)| text.starts_with(p.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
struct MockContainer {
    cpu: CpuSettings,
    labels: BTreeMap<String, String>,
    cpu_percent: f64,
    ip: Option<String>,
}

#[derive(Default)]
struct MockRuntimeState {
    containers: BTreeMap<String, MockContainer>,
    killed: Vec<String>,
    failing_updates: HashSet<String>,
    listing_fails: bool,
}

/// Container runtime backed by a map of containers
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockRuntimeState>,
}

impl MockRuntime {
    pub fn add_container(&self, id: &str, period: i64, quota: i64) {
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            MockContainer {
                cpu: CpuSettings { period, quota },
                ..Default::default()
            },
        );
    }

    pub fn remove_container(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn set_labels(&self, id: &str, labels: &[(&str, &str)]) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.labels = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
    }

    pub fn set_ip(&self, id: &str, ip: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.ip = Some(ip.to_string());
        }
    }

    pub fn set_cpu_percent(&self, id: &str, percent: f64) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.cpu_percent = percent;
        }
    }

    pub fn fail_updates_for(&self, id: &str) {
        self.state.lock().unwrap().failing_updates.insert(id.to_string());
    }

    pub fn fail_listing(&self) {
        self.state.lock().unwrap().listing_fails = true;
    }

    pub fn cpu(&self, id: &str) -> CpuSettings {
        self.state.lock().unwrap().containers[id].cpu
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerDetails {
            id: id.to_string(),
            name: id.to_string(),
            cpu: container.cpu,
        })
    }

    async fn update_cpu(&self, id: &str, update: CpuUpdate) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_updates.contains(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(period) = update.period {
            container.cpu.period = period;
        }
        if let Some(quota) = update.quota {
            container.cpu.quota = quota;
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(id).is_none() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.killed.push(id.to_string());
        Ok(())
    }

    async fn cpu_percent(&self, id: &str) -> Result<f64, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(id)
            .map(|c| c.cpu_percent)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn host_cpu_count(&self) -> Result<u32, RuntimeError> {
        Ok(4)
    }

    async fn host_name(&self) -> Result<String, RuntimeError> {
        Ok("mock-host".to_string())
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(RuntimeError::Incomplete {
                id: "*".to_string(),
                field: "container list",
            });
        }
        Ok(state
            .containers
            .iter()
            .map(|(id, c)| RuntimeContainer {
                id: id.clone(),
                name: id.clone(),
                labels: c.labels.clone(),
                ip_address: c.ip.clone(),
            })
            .collect())
    }
}

/// Orchestrator that records mutations and replays a fixed event list
#[derive(Default)]
pub struct RecordingOrchestrator {
    events: Mutex<Vec<PodEvent>>,
    deleted: Mutex<Vec<String>>,
    labels: Mutex<Vec<(String, String, String)>>,
}

impl RecordingOrchestrator {
    pub fn push_event(&self, event: PodEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<(String, String, String)> {
        self.labels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
    async fn watch_pods(&self) -> Result<PodEventStream, OrchestratorError> {
        let events: Vec<Result<PodEvent, OrchestratorError>> = self
            .events
            .lock()
            .unwrap()
            .drain(..)
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(events)))
    }

    async fn node_cpu_count(&self, _node: &str) -> Result<u32, OrchestratorError> {
        Ok(4)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        self.deleted
            .lock()
            .unwrap()
            .push(format!("{}/{}", namespace, name));
        Ok(())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), OrchestratorError> {
        self.labels
            .lock()
            .unwrap()
            .push((node.to_string(), key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Slack, switch and utilization with settable values. `None` fails the read.
pub struct FixedSignals {
    enabled: Mutex<Option<bool>>,
    slack: Mutex<Option<Slack>>,
    utilization: Mutex<Option<f64>>,
    queried_apps: Mutex<Vec<String>>,
}

impl Default for FixedSignals {
    fn default() -> Self {
        Self {
            enabled: Mutex::new(Some(true)),
            slack: Mutex::new(Some(Slack::default())),
            utilization: Mutex::new(Some(0.0)),
            queried_apps: Mutex::new(Vec::new()),
        }
    }
}

impl FixedSignals {
    pub fn set_enabled(&self, enabled: Option<bool>) {
        *self.enabled.lock().unwrap() = enabled;
    }

    pub fn set_slack(&self, slack: Option<f64>) {
        *self.slack.lock().unwrap() = slack.map(|slack| Slack {
            slack,
            latency: 10.0,
        });
    }

    pub fn set_utilization(&self, percent: Option<f64>) {
        *self.utilization.lock().unwrap() = percent;
    }

    pub fn queried_apps(&self) -> Vec<String> {
        self.queried_apps.lock().unwrap().clone()
    }
}

fn unavailable() -> SignalError {
    SignalError::Store("signal unavailable".to_string())
}

#[async_trait]
impl SlackSource for FixedSignals {
    async fn controller_enabled(&self) -> Result<bool, SignalError> {
        self.enabled.lock().unwrap().ok_or_else(unavailable)
    }

    async fn slack(&self, app: &str) -> Result<Slack, SignalError> {
        self.queried_apps.lock().unwrap().push(app.to_string());
        self.slack.lock().unwrap().ok_or_else(unavailable)
    }
}

#[async_trait]
impl UtilizationSource for FixedSignals {
    async fn node_cpu_percent(&self) -> Result<f64, SignalError> {
        self.utilization.lock().unwrap().ok_or_else(unavailable)
    }
}

/// Sink keeping every record in memory
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(String, CycleRecord)>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<(String, CycleRecord)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn write(&self, hostname: &str, record: &CycleRecord) {
        self.records
            .lock()
            .unwrap()
            .push((hostname.to_string(), record.clone()));
    }
}

/// A context wired to mocks, plus handles to those mocks
pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub runtime: Arc<MockRuntime>,
    pub runner: Arc<ScriptedRunner>,
    pub signals: Arc<FixedSignals>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Arc<RecordingOrchestrator>,
}

impl TestHarness {
    pub fn new(cpu_count: u32, config: ControllerConfig, orchestrated: bool) -> Self {
        let runtime = Arc::new(MockRuntime::default());
        let runner = Arc::new(ScriptedRunner::default());
        let signals = Arc::new(FixedSignals::default());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Arc::new(RecordingOrchestrator::default());

        let mode = if orchestrated {
            ClusterMode::Orchestrated {
                orchestrator: orchestrator.clone(),
            }
        } else {
            ClusterMode::RuntimeOnly
        };

        let ctx = AppContext::builder("node-1", cpu_count, config)
            .mode(mode)
            .runtime(runtime.clone())
            .commands(runner.clone())
            .slack(signals.clone())
            .utilization(signals.clone())
            .sink(sink.clone())
            .build()
            .unwrap();

        Self {
            ctx: Arc::new(ctx),
            runtime,
            runner,
            signals,
            sink,
            orchestrator,
        }
    }

    /// Track a running pod on this node with one container per id
    pub async fn track_pod(&self, object: &PodObject) {
        for id in object.runtime_ids() {
            if self.runtime.inspect(id).await.is_err() {
                self.runtime.add_container(id, 100_000, -1);
            }
        }
        let key = object.key();
        self.ctx.registry.add_pod(&key, object).await.unwrap();
        self.ctx
            .registry
            .modify_pod(&key, object, self.runtime.as_ref(), self.ctx.admission_clamp())
            .await
            .unwrap();
    }
}

pub fn test_context(cpu_count: u32) -> AppContext {
    AppContext::builder("node-1", cpu_count, ControllerConfig::default())
        .runtime(Arc::new(MockRuntime::default()))
        .commands(Arc::new(ScriptedRunner::default()))
        .slack(Arc::new(FixedSignals::default()))
        .utilization(Arc::new(FixedSignals::default()))
        .build()
        .unwrap()
}

/// A running pod on `node-1` with the given workload class and containers
pub fn pod_object(namespace: &str, name: &str, best_effort: bool, ids: &[&str]) -> PodObject {
    let mut object = PodObject {
        name: name.to_string(),
        namespace: namespace.to_string(),
        uid: format!("uid-{}", name),
        node_name: Some("node-1".to_string()),
        phase: Some("Running".to_string()),
        qos_class: Some(if best_effort { "BestEffort" } else { "Guaranteed" }.to_string()),
        ..Default::default()
    };
    if best_effort {
        object
            .labels
            .insert(WCLASS_LABEL.to_string(), "BE".to_string());
    }
    for id in ids {
        object.container_statuses.push(ContainerStatus {
            name: id.to_string(),
            container_id: Some(format!("docker://{}", id)),
        });
    }
    object
}

/// Mark a pod as the QoS application
pub fn qos_tracked(mut object: PodObject) -> PodObject {
    object
        .labels
        .insert(QOS_LABEL.to_string(), "true".to_string());
    object
}
