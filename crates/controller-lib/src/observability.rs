//! Observability infrastructure for the BE controller
//!
//! Provides:
//! - Prometheus metrics (slack, utilization, pod counts, BE allocations, loop activity)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter_vec, register_int_gauge_vec,
    register_int_gauge, Gauge, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    slo_slack: Gauge,
    node_cpu_utilization: Gauge,
    pods: IntGaugeVec,
    be_quota: IntGauge,
    net_be_limit_mbps: GaugeVec,
    blkio_be_limit_iops: IntGaugeVec,
    cycles: IntCounterVec,
    cpu_actions: IntCounterVec,
    actuator_errors: IntCounterVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            slo_slack: register_gauge!(
                "be_controller_slo_slack",
                "Latency slack of the tracked QoS application"
            )
            .expect("Failed to register slo_slack"),

            node_cpu_utilization: register_gauge!(
                "be_controller_node_cpu_utilization_percent",
                "Node CPU utilization seen by the CPU controller"
            )
            .expect("Failed to register node_cpu_utilization"),

            pods: register_int_gauge_vec!(
                "be_controller_pods",
                "Tracked pods on this node by workload class",
                &["class"]
            )
            .expect("Failed to register pods"),

            be_quota: register_int_gauge!(
                "be_controller_be_quota_us",
                "Aggregate CPU quota of BE containers in microseconds per period"
            )
            .expect("Failed to register be_quota"),

            net_be_limit_mbps: register_gauge_vec!(
                "be_controller_net_be_limit_mbps",
                "Bandwidth allowed to BE traffic",
                &["direction"]
            )
            .expect("Failed to register net_be_limit_mbps"),

            blkio_be_limit_iops: register_int_gauge_vec!(
                "be_controller_blkio_be_limit_iops",
                "IOPS allowed to BE workloads",
                &["direction"]
            )
            .expect("Failed to register blkio_be_limit_iops"),

            cycles: register_int_counter_vec!(
                "be_controller_cycles_total",
                "Control loop cycles run",
                &["controller"]
            )
            .expect("Failed to register cycles"),

            cpu_actions: register_int_counter_vec!(
                "be_controller_cpu_actions_total",
                "Actions chosen by the CPU controller",
                &["action"]
            )
            .expect("Failed to register cpu_actions"),

            actuator_errors: register_int_counter_vec!(
                "be_controller_actuator_errors_total",
                "Failed resource control operations",
                &["controller"]
            )
            .expect("Failed to register actuator_errors"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn set_slack(&self, slack: f64) {
        self.inner().slo_slack.set(slack);
    }

    pub fn set_node_cpu_utilization(&self, percent: f64) {
        self.inner().node_cpu_utilization.set(percent);
    }

    pub fn set_pod_counts(&self, hp: i64, be: i64) {
        self.inner().pods.with_label_values(&["hp"]).set(hp);
        self.inner().pods.with_label_values(&["be"]).set(be);
    }

    pub fn set_be_quota(&self, quota: i64) {
        self.inner().be_quota.set(quota);
    }

    pub fn set_net_limits(&self, egress_mbps: f64, ingress_mbps: f64) {
        let limits = &self.inner().net_be_limit_mbps;
        limits.with_label_values(&["egress"]).set(egress_mbps);
        limits.with_label_values(&["ingress"]).set(ingress_mbps);
    }

    pub fn set_blkio_limits(&self, read_iops: u64, write_iops: u64) {
        let limits = &self.inner().blkio_be_limit_iops;
        limits.with_label_values(&["read"]).set(read_iops as i64);
        limits.with_label_values(&["write"]).set(write_iops as i64);
    }

    pub fn inc_cycles(&self, controller: &str) {
        self.inner().cycles.with_label_values(&[controller]).inc();
    }

    pub fn inc_cpu_action(&self, action: &str) {
        self.inner().cpu_actions.with_label_values(&[action]).inc();
    }

    pub fn inc_actuator_errors(&self, controller: &str, count: u64) {
        if count > 0 {
            self.inner()
                .actuator_errors
                .with_label_values(&[controller])
                .inc_by(count);
        }
    }
}

/// Structured logger for controller events
///
/// Provides consistent JSON-formatted logging for lifecycle and
/// arbitration decisions.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, mode: &str, cpu_count: u32) {
        info!(
            event = "controller_started",
            node = %self.node_name,
            controller_version = %version,
            mode = %mode,
            cpu_count,
            "BE controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            node = %self.node_name,
            reason = %reason,
            "BE controller shutting down"
        );
    }

    /// Log a CPU decision that changed BE allocation
    pub fn log_cpu_action(
        &self,
        action: &str,
        slack: f64,
        utilization: f64,
        be_pods: usize,
        be_quota: i64,
    ) {
        info!(
            event = "cpu_action",
            node = %self.node_name,
            action = %action,
            slack,
            cpu_utilization = utilization,
            be_pods,
            be_quota,
            "CPU controller acted on BE workloads"
        );
    }

    pub fn log_be_admission(&self, enabled: bool, succeeded: bool) {
        if succeeded {
            info!(
                event = "be_admission_changed",
                node = %self.node_name,
                enabled,
                "BE admission updated"
            );
        } else {
            warn!(
                event = "be_admission_changed",
                node = %self.node_name,
                enabled,
                succeeded = false,
                "Failed to update BE admission"
            );
        }
    }
}
