//! CPU control loop
//!
//! Each cycle reads the global switch, the QoS application's slack and the
//! node CPU utilization, then walks a threshold ladder where the first
//! matching rung wins. The switch value read here is published to the
//! context for the other loops.

use super::{gate, Skip};
use crate::actuator::{CpuActuator, QuotaAdjustment};
use crate::config::QuotaControllerConfig;
use crate::context::AppContext;
use crate::health::components;
use crate::registry::RegistrySnapshot;
use crate::signal::Slack;
use crate::sink::CycleRecord;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Utilization assumed when the node's usage cannot be read
const UNKNOWN_UTILIZATION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    /// Stop every BE pod and refuse new BE work
    Disable,
    /// Every BE quota back to the minimum
    Reset,
    /// Shrink in proportion to the slack deficit
    ShrinkBySlack,
    /// Shrink because the node is overloaded
    ShrinkByLoad,
    /// Admit BE work again (no BE pods yet)
    Enable,
    Grow,
    Hold,
}

impl CpuAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuAction::Disable => "disable_be",
            CpuAction::Reset => "reset_be",
            CpuAction::ShrinkBySlack => "shrink_be",
            CpuAction::ShrinkByLoad => "shrink_be_load",
            CpuAction::Enable => "enable_be",
            CpuAction::Grow => "grow_be",
            CpuAction::Hold => "none",
        }
    }
}

impl fmt::Display for CpuAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the first matching rung of the threshold ladder
pub fn decide(
    config: &QuotaControllerConfig,
    slack: f64,
    utilization: f64,
    has_be_pods: bool,
) -> CpuAction {
    let room_to_grow =
        slack > config.slack_threshold_grow && utilization < config.load_threshold_grow;

    if has_be_pods && slack < config.slack_threshold_disable {
        CpuAction::Disable
    } else if has_be_pods && slack < config.slack_threshold_reset {
        CpuAction::Reset
    } else if has_be_pods && slack < config.slack_threshold_shrink {
        CpuAction::ShrinkBySlack
    } else if has_be_pods && utilization > config.load_threshold_shrink {
        CpuAction::ShrinkByLoad
    } else if room_to_grow && !has_be_pods {
        CpuAction::Enable
    } else if room_to_grow {
        CpuAction::Grow
    } else {
        CpuAction::Hold
    }
}

pub struct CpuController {
    ctx: Arc<AppContext>,
    actuator: CpuActuator,
    cycle: u64,
}

impl CpuController {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let actuator = CpuActuator::new(ctx.runtime.clone(), ctx.registry.clone(), ctx.quota_bounds());
        Self {
            ctx,
            actuator,
            cycle: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.ctx.config.quota_controller.period();
        let bounds = self.actuator.bounds();
        info!(
            period_secs = period.as_secs(),
            min_be_quota = bounds.min,
            max_be_quota = bounds.max,
            "Starting CPU controller"
        );
        self.ctx.health.set_healthy(components::CPU_CONTROLLER).await;

        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down CPU controller");
                    break;
                }
            }
        }
    }

    /// Run one cycle. `None` when the cycle was skipped.
    pub async fn cycle(&mut self) -> Option<CpuAction> {
        let ctx = self.ctx.clone();
        self.refresh_switch().await;

        if let Some(skip) = gate(&ctx, ctx.config.quota_controller.disabled) {
            match skip {
                Skip::SwitchedOff => debug!("BE controller is switched off, skipping CPU cycle"),
                Skip::Disabled => debug!("CPU controller is disabled"),
            }
            return None;
        }

        let qos_app = ctx.registry.qos_app().await;
        let slack = match qos_app.as_deref() {
            Some(app) => ctx.slack.slack(app).await.unwrap_or_else(|e| {
                warn!(subsystem = "cpu", app = %app, error = %e, "Cannot read SLO slack, using 0");
                Slack::default()
            }),
            None => Slack::default(),
        };
        let utilization = ctx.utilization.node_cpu_percent().await.unwrap_or_else(|e| {
            warn!(
                subsystem = "cpu",
                error = %e,
                "Cannot read node CPU utilization, assuming saturation"
            );
            UNKNOWN_UTILIZATION
        });

        let snapshot = ctx.registry.snapshot().await;
        let config = &ctx.config.quota_controller;
        let action = decide(config, slack.slack, utilization, snapshot.has_be_pods());

        debug!(
            cycle = self.cycle,
            qos_app = ?qos_app,
            slack = slack.slack,
            cpu_usage = utilization,
            be_pods = snapshot.be_pods,
            action = %action,
            "CPU controller cycle"
        );

        let failures = self
            .execute(action, &snapshot, slack.slack, utilization)
            .await;

        let be_quota: i64 = ctx
            .registry
            .snapshot()
            .await
            .be_containers()
            .map(|(_, c)| c.cpu.quota.max(0))
            .sum();
        ctx.node.set_be_quota(be_quota);

        ctx.metrics.set_slack(slack.slack);
        ctx.metrics.set_node_cpu_utilization(utilization);
        ctx.metrics.set_be_quota(be_quota);
        ctx.metrics.inc_cycles("cpu");
        ctx.metrics.inc_cpu_action(action.as_str());
        ctx.metrics.inc_actuator_errors("cpu", failures as u64);
        if action != CpuAction::Hold {
            ctx.logger
                .log_cpu_action(action.as_str(), slack.slack, utilization, snapshot.be_pods, be_quota);
        }

        let record = CycleRecord::new("cpu_quota")
            .field("cycle", self.cycle)
            .field("qos_app", qos_app.unwrap_or_default())
            .field("slack", slack.slack)
            .field("latency", slack.latency)
            .field("cpu_usage", utilization)
            .field("hp_pods", snapshot.hp_pods)
            .field("be_pods", snapshot.be_pods)
            .field("action", action.as_str())
            .field("be_quota", be_quota);
        ctx.write_record(record).await;

        self.cycle += 1;
        Some(action)
    }

    /// Poll the global switch; an unreachable store keeps the last value
    async fn refresh_switch(&self) {
        match self.ctx.slack.controller_enabled().await {
            Ok(enabled) => {
                if self.ctx.set_enabled(enabled) != enabled {
                    info!(enabled, "BE controller switch changed");
                }
            }
            Err(e) => warn!(
                subsystem = "cpu",
                error = %e,
                enabled = self.ctx.is_enabled(),
                "Cannot read controller switch, keeping last value"
            ),
        }
    }

    /// Apply an action; returns the number of failed operations
    async fn execute(
        &self,
        action: CpuAction,
        snapshot: &RegistrySnapshot,
        slack: f64,
        utilization: f64,
    ) -> usize {
        let config = &self.ctx.config.quota_controller;
        let adjustment = match action {
            CpuAction::Disable => return self.disable_be(snapshot).await,
            CpuAction::Enable => {
                return usize::from(!self.set_admission(true).await);
            }
            CpuAction::Hold => return 0,
            CpuAction::Reset => self.actuator.reset_be(snapshot).await,
            CpuAction::ShrinkBySlack => {
                let excess = slack - config.slack_threshold_shrink;
                self.actuator
                    .shrink_be(snapshot, config.be_shrink_ratio, excess)
                    .await
            }
            CpuAction::ShrinkByLoad => {
                let excess = (config.load_threshold_shrink - utilization) / 100.0;
                self.actuator
                    .shrink_be(snapshot, config.be_shrink_ratio, excess)
                    .await
            }
            CpuAction::Grow => {
                self.actuator
                    .grow_be(snapshot, config.be_growth_ratio, slack)
                    .await
            }
        };

        log_adjustment(action, &adjustment);
        adjustment.failed
    }

    async fn disable_be(&self, snapshot: &RegistrySnapshot) -> usize {
        let mut failures = 0;
        for pod in snapshot.be_pods() {
            if let Err(e) = self
                .ctx
                .mode
                .stop_workload(self.ctx.runtime.as_ref(), pod)
                .await
            {
                warn!(subsystem = "cpu", pod = %pod.key(), error = %e, "Cannot stop BE pod");
                failures += 1;
            }
        }
        if !self.set_admission(false).await {
            failures += 1;
        }
        failures
    }

    async fn set_admission(&self, enabled: bool) -> bool {
        let result = self
            .ctx
            .mode
            .set_be_admission(&self.ctx.node.name, enabled)
            .await;
        if let Err(e) = &result {
            warn!(subsystem = "cpu", enabled, error = %e, "Cannot update BE admission");
        }
        self.ctx.logger.log_be_admission(enabled, result.is_ok());
        result.is_ok()
    }
}

fn log_adjustment(action: CpuAction, adjustment: &QuotaAdjustment) {
    debug!(
        action = %action,
        updated = adjustment.updated,
        failed = adjustment.failed,
        total_quota = adjustment.total_quota,
        "BE quotas adjusted"
    );
}
