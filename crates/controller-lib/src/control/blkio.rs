//! Block I/O control loop

use super::gate;
use crate::actuator::{BlkioActuator, BlkioError, LimitOutcome};
use crate::context::AppContext;
use crate::health::components;
use crate::sink::CycleRecord;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// IOPS left to BE after HP usage and a headroom of 5% of the device
/// maximum or 10% of HP usage, whichever is larger
pub fn be_iops_limit(max_iops: u64, hp_iops: u64) -> u64 {
    let max = max_iops as f64;
    let hp = hp_iops as f64;
    (max - hp - (0.05 * max).max(0.1 * hp)).max(0.0) as u64
}

/// Per-direction (read, write) figures of one block I/O cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlkioCycle {
    pub hp_iops: (u64, u64),
    pub be_iops: (u64, u64),
    pub be_limit: (u64, u64),
    pub applied: LimitOutcome,
}

pub struct BlkioController {
    ctx: Arc<AppContext>,
    actuator: BlkioActuator,
    /// Cumulative (read, write) counters from the previous cycle
    counters: HashMap<String, (u64, u64)>,
    last_sample: Option<Instant>,
    cycle: u64,
}

impl BlkioController {
    pub fn new(ctx: Arc<AppContext>) -> Result<Self, BlkioError> {
        let actuator = BlkioActuator::new(ctx.commands.clone(), &ctx.config.blkio_controller)?;
        Ok(Self {
            ctx,
            actuator,
            counters: HashMap::new(),
            last_sample: None,
            cycle: 0,
        })
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let config = &self.ctx.config.blkio_controller;
        let period = config.period();
        info!(
            block_dev = %config.block_dev,
            max_rd_iops = config.max_rd_iops,
            max_wr_iops = config.max_wr_iops,
            "Starting blkio controller"
        );
        self.ctx.health.set_healthy(components::BLKIO_CONTROLLER).await;

        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle_at(Instant::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down blkio controller");
                    break;
                }
            }
        }
    }

    /// Run one cycle sampled at `now`. `None` when the cycle was skipped.
    pub async fn cycle_at(&mut self, now: Instant) -> Option<BlkioCycle> {
        let ctx = self.ctx.clone();

        if gate(&ctx, ctx.config.blkio_controller.disabled).is_some() {
            self.release_all().await;
            return None;
        }

        let snapshot = ctx.registry.snapshot().await;
        let mut errors = 0u64;
        let mut counters = HashMap::new();
        let mut be_keys = BTreeSet::new();
        let (mut hp_ops, mut be_ops) = ((0u64, 0u64), (0u64, 0u64));

        for (pod, container) in snapshot.containers() {
            let key = ctx.mode.cgroup_key(pod, &container.id);
            let used = match self.actuator.get_iops_used(&key).await {
                Ok(used) => used,
                Err(e) => {
                    warn!(subsystem = "blkio", cgroup = %key, error = %e, "Cannot read IOPS usage");
                    errors += 1;
                    // A throttled workload keeps its share and baseline, counted as idle
                    if pod.is_best_effort() && self.actuator.keys().contains(&key) {
                        if let Some(prev) = self.counters.get(&key) {
                            counters.insert(key.clone(), *prev);
                        }
                        be_keys.insert(key);
                    }
                    continue;
                }
            };

            // A workload's first reading is only a baseline
            let (read, write) = match self.counters.get(&key) {
                Some(prev) => (used.0.saturating_sub(prev.0), used.1.saturating_sub(prev.1)),
                None => (0, 0),
            };
            let sums = if pod.is_best_effort() {
                be_keys.insert(key.clone());
                &mut be_ops
            } else {
                &mut hp_ops
            };
            sums.0 += read;
            sums.1 += write;
            counters.insert(key, used);
        }

        let elapsed = self
            .last_sample
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        let rate = |ops: u64| {
            if elapsed > 0.0 {
                (ops as f64 / elapsed) as u64
            } else {
                0
            }
        };
        let hp_iops = (rate(hp_ops.0), rate(hp_ops.1));
        let be_iops = (rate(be_ops.0), rate(be_ops.1));
        self.counters = counters;
        self.last_sample = Some(now);

        errors += self.reconcile(&be_keys);

        let (max_rd, max_wr) = self.actuator.max_iops();
        let be_limit = (be_iops_limit(max_rd, hp_iops.0), be_iops_limit(max_wr, hp_iops.1));
        let applied = match self.actuator.set_iops_limit(be_limit.0, be_limit.1).await {
            Ok(outcome) => {
                errors += outcome.skipped as u64;
                outcome
            }
            Err(e) => {
                warn!(subsystem = "blkio", error = %e, "Cannot apply BE IOPS limit");
                errors += 1;
                LimitOutcome::default()
            }
        };

        debug!(
            cycle = self.cycle,
            hp_rd_iops = hp_iops.0,
            hp_wr_iops = hp_iops.1,
            be_rd_iops = be_iops.0,
            be_wr_iops = be_iops.1,
            be_rd_limit = be_limit.0,
            be_wr_limit = be_limit.1,
            be_workloads = be_keys.len(),
            "Blkio controller cycle"
        );

        ctx.metrics.set_blkio_limits(be_limit.0, be_limit.1);
        ctx.metrics.inc_cycles("blkio");
        ctx.metrics.inc_actuator_errors("blkio", errors);

        let record = CycleRecord::new("blkio")
            .field("cycle", self.cycle)
            .field("max_rd_iops", max_rd)
            .field("max_wr_iops", max_wr)
            .field("total_rd_iops", hp_iops.0 + be_iops.0)
            .field("total_wr_iops", hp_iops.1 + be_iops.1)
            .field("hp_rd_iops", hp_iops.0)
            .field("hp_wr_iops", hp_iops.1)
            .field("be_rd_iops", be_iops.0)
            .field("be_wr_iops", be_iops.1)
            .field("be_rd_limit", be_limit.0)
            .field("be_wr_limit", be_limit.1);
        ctx.write_record(record).await;

        self.cycle += 1;
        Some(BlkioCycle {
            hp_iops,
            be_iops,
            be_limit,
            applied,
        })
    }

    /// Make the throttled set match the current BE cgroups; returns the error count
    fn reconcile(&mut self, be_keys: &BTreeSet<String>) -> u64 {
        let stale: Vec<String> = self.actuator.keys().difference(be_keys).cloned().collect();
        let fresh: Vec<String> = be_keys.difference(self.actuator.keys()).cloned().collect();
        let mut errors = 0;

        for key in stale {
            if let Err(e) = self.actuator.remove_workload(&key) {
                warn!(subsystem = "blkio", cgroup = %key, error = %e, "Cannot untrack workload");
                errors += 1;
            }
        }
        for key in fresh {
            if let Err(e) = self.actuator.add_workload(&key) {
                warn!(subsystem = "blkio", cgroup = %key, error = %e, "Cannot track workload");
                errors += 1;
            }
        }
        errors
    }

    /// Lift every throttle and forget the tracked workloads
    async fn release_all(&mut self) {
        if self.actuator.keys().is_empty() {
            return;
        }
        let outcome = self.actuator.clear_iops_limit().await;
        info!(
            cleared = outcome.applied,
            skipped = outcome.skipped,
            "Blkio controller inactive, BE throttles lifted"
        );
        self.reconcile(&BTreeSet::new());
        self.counters.clear();
        self.last_sample = None;
    }
}
