//! Application context shared by every long-lived task

use crate::actuator::QuotaBounds;
use crate::command::CommandRunner;
use crate::config::ControllerConfig;
use crate::health::HealthRegistry;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::orchestrator::ClusterMode;
use crate::registry::WorkloadRegistry;
use crate::runtime::ContainerRuntime;
use crate::signal::{SlackSource, UtilizationSource};
use crate::sink::{CycleRecord, MetricsSink, NoopSink};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Identity and capacity of the node being arbitrated
#[derive(Debug)]
pub struct NodeInfo {
    pub name: String,
    pub cpu_count: u32,
    be_quota: AtomicI64,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, cpu_count: u32) -> Self {
        Self {
            name: name.into(),
            cpu_count,
            be_quota: AtomicI64::new(0),
        }
    }

    /// Aggregate BE quota computed by the last CPU cycle
    pub fn be_quota(&self) -> i64 {
        self.be_quota.load(Ordering::Relaxed)
    }

    pub fn set_be_quota(&self, quota: i64) {
        self.be_quota.store(quota, Ordering::Relaxed);
    }
}

pub struct AppContext {
    pub node: NodeInfo,
    pub config: ControllerConfig,
    pub registry: Arc<WorkloadRegistry>,
    pub mode: ClusterMode,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub commands: Arc<dyn CommandRunner>,
    pub slack: Arc<dyn SlackSource>,
    pub utilization: Arc<dyn UtilizationSource>,
    pub sink: Arc<dyn MetricsSink>,
    pub metrics: ControllerMetrics,
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
    enabled: AtomicBool,
}

impl AppContext {
    pub fn builder(
        node_name: impl Into<String>,
        cpu_count: u32,
        config: ControllerConfig,
    ) -> AppContextBuilder {
        AppContextBuilder {
            node_name: node_name.into(),
            cpu_count,
            config,
            mode: ClusterMode::RuntimeOnly,
            registry: None,
            runtime: None,
            commands: None,
            slack: None,
            utilization: None,
            sink: None,
            health: None,
        }
    }

    /// Global controller switch as last published by the CPU loop
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Publish the switch, returning the previous value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    pub fn quota_bounds(&self) -> QuotaBounds {
        let q = &self.config.quota_controller;
        QuotaBounds::from_fractions(self.node.cpu_count, q.min_be_quota, q.max_be_quota)
    }

    /// Bounds for the admission clamp; none while the controller is switched off
    pub fn admission_clamp(&self) -> Option<QuotaBounds> {
        self.is_enabled().then(|| self.quota_bounds())
    }

    /// Hand a record to the sink when metrics writing is on
    pub async fn write_record(&self, record: CycleRecord) {
        if self.config.write_metrics {
            self.sink.write(&self.node.name, &record).await;
        }
    }
}

pub struct AppContextBuilder {
    node_name: String,
    cpu_count: u32,
    config: ControllerConfig,
    mode: ClusterMode,
    registry: Option<Arc<WorkloadRegistry>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    commands: Option<Arc<dyn CommandRunner>>,
    slack: Option<Arc<dyn SlackSource>>,
    utilization: Option<Arc<dyn UtilizationSource>>,
    sink: Option<Arc<dyn MetricsSink>>,
    health: Option<HealthRegistry>,
}

impl AppContextBuilder {
    pub fn mode(mut self, mode: ClusterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn registry(mut self, registry: Arc<WorkloadRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn commands(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn slack(mut self, slack: Arc<dyn SlackSource>) -> Self {
        self.slack = Some(slack);
        self
    }

    pub fn utilization(mut self, utilization: Arc<dyn UtilizationSource>) -> Self {
        self.utilization = Some(utilization);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<AppContext> {
        if self.cpu_count == 0 {
            return Err(anyhow!("node {} reports no CPUs", self.node_name));
        }

        let logger = StructuredLogger::new(&self.node_name);
        Ok(AppContext {
            node: NodeInfo::new(self.node_name, self.cpu_count),
            config: self.config,
            registry: self.registry.unwrap_or_default(),
            mode: self.mode,
            runtime: self.runtime.ok_or_else(|| anyhow!("container runtime not set"))?,
            commands: self.commands.ok_or_else(|| anyhow!("command runner not set"))?,
            slack: self.slack.ok_or_else(|| anyhow!("slack source not set"))?,
            utilization: self
                .utilization
                .ok_or_else(|| anyhow!("utilization source not set"))?,
            sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
            metrics: ControllerMetrics::new(),
            health: self.health.unwrap_or_default(),
            logger,
            enabled: AtomicBool::new(true),
        })
    }
}
