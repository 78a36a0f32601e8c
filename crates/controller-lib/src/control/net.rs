//! Network bandwidth control loop

use super::gate;
use crate::actuator::{NetActuator, NetError, NetStats};
use crate::context::AppContext;
use crate::health::components;
use crate::sink::CycleRecord;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// HP usage and the BE allowance for one direction, in mbps.
///
/// HP usage is total minus BE, clamped at zero since the BE class counter
/// can run ahead of the interface total. The allowance leaves a headroom of
/// 10% of the larger of the link cap and HP usage, and never drops below
/// `floor`.
pub fn be_bandwidth_allowance(max_bw: f64, total: f64, be: f64, floor: f64) -> (f64, f64) {
    let hp = (total - be).max(0.0);
    let headroom = (0.1 * max_bw).max(0.1 * hp);
    (hp, (max_bw - hp - headroom).max(floor))
}

/// What one network cycle measured and applied
#[derive(Debug, Clone, PartialEq)]
pub struct NetCycle {
    pub stats: NetStats,
    pub egress_limit_mbps: f64,
    pub ingress_limit_mbps: f64,
    pub tracked_ips: usize,
}

pub struct NetController {
    ctx: Arc<AppContext>,
    actuator: NetActuator,
    cycle: u64,
}

impl NetController {
    pub fn new(ctx: Arc<AppContext>) -> Result<Self, NetError> {
        let actuator = NetActuator::new(ctx.commands.clone(), &ctx.config.net_controller)?;
        Ok(Self {
            ctx,
            actuator,
            cycle: 0,
        })
    }

    /// Install the qdisc hierarchy, then run cycles until shutdown.
    ///
    /// A failed setup ends the loop; the rest of the controller keeps going.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let config = &self.ctx.config.net_controller;
        let period = config.period();
        info!(
            iface_ext = %config.iface_ext,
            iface_cont = %config.iface_cont,
            max_bw_mbps = config.max_bw_mbps,
            link_bw_mbps = config.link_bw_mbps,
            "Starting network controller"
        );

        if let Err(e) = self.actuator.init().await {
            error!(subsystem = "net", error = %e, "Network setup failed, network controller stopped");
            self.ctx
                .health
                .set_degraded(components::NET_CONTROLLER, format!("setup failed: {}", e))
                .await;
            return;
        }
        self.ctx.health.set_healthy(components::NET_CONTROLLER).await;

        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down network controller");
                    break;
                }
            }
        }
    }

    /// Run one cycle. `None` when skipped or when stats could not be read.
    pub async fn cycle(&mut self) -> Option<NetCycle> {
        let ctx = self.ctx.clone();

        if gate(&ctx, ctx.config.net_controller.disabled).is_some() {
            // Stale filters must not outlive an active controller
            let removed = self.reconcile(&BTreeSet::new()).await;
            if removed > 0 {
                info!(removed, "Network controller inactive, BE filters removed");
            }
            return None;
        }

        let snapshot = ctx.registry.snapshot().await;
        let wanted: BTreeSet<IpAddr> = snapshot
            .be_ips()
            .iter()
            .filter_map(|ip| match ip.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(subsystem = "net", ip = %ip, "Ignoring unparsable BE pod address");
                    None
                }
            })
            .collect();
        self.reconcile(&wanted).await;

        let stats = match self.actuator.current_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(subsystem = "net", error = %e, "Cannot read network statistics");
                ctx.metrics.inc_actuator_errors("net", 1);
                return None;
            }
        };

        let max_bw = self.actuator.max_bw_mbps();
        let floor = self.actuator.default_limit_mbps();
        let (egress_hp, egress_limit) =
            be_bandwidth_allowance(max_bw, stats.egress_total_mbps, stats.egress_be_mbps, floor);
        let (ingress_hp, ingress_limit) =
            be_bandwidth_allowance(max_bw, stats.ingress_total_mbps, stats.ingress_be_mbps, floor);

        if let Err(e) = self.actuator.set_egress_limit(egress_limit).await {
            warn!(subsystem = "net", error = %e, "Cannot set egress BE limit");
            ctx.metrics.inc_actuator_errors("net", 1);
        }
        if let Err(e) = self.actuator.set_ingress_limit(ingress_limit).await {
            warn!(subsystem = "net", error = %e, "Cannot set ingress BE limit");
            ctx.metrics.inc_actuator_errors("net", 1);
        }

        let tracked_ips = self.actuator.tracked_ips().len();
        debug!(
            cycle = self.cycle,
            egress_total_mbps = stats.egress_total_mbps,
            egress_hp_mbps = egress_hp,
            egress_be_alloc_mbps = egress_limit,
            ingress_total_mbps = stats.ingress_total_mbps,
            ingress_hp_mbps = ingress_hp,
            ingress_be_alloc_mbps = ingress_limit,
            tracked_ips,
            "Network controller cycle"
        );

        ctx.metrics.set_net_limits(egress_limit, ingress_limit);
        ctx.metrics.inc_cycles("net");

        let record = CycleRecord::new("net")
            .field("cycle", self.cycle)
            .field("egress_total_mbps", stats.egress_total_mbps)
            .field("egress_hp_mbps", egress_hp)
            .field("egress_be_mbps", stats.egress_be_mbps)
            .field("egress_be_alloc_mbps", egress_limit)
            .field("ingress_total_mbps", stats.ingress_total_mbps)
            .field("ingress_hp_mbps", ingress_hp)
            .field("ingress_be_mbps", stats.ingress_be_mbps)
            .field("ingress_be_alloc_mbps", ingress_limit)
            .field("tracked_ips", tracked_ips);
        ctx.write_record(record).await;

        self.cycle += 1;
        Some(NetCycle {
            stats,
            egress_limit_mbps: egress_limit,
            ingress_limit_mbps: ingress_limit,
            tracked_ips,
        })
    }

    /// Add filters for new or half-removed BE addresses and drop stale ones.
    /// Returns the number of addresses removed.
    async fn reconcile(&mut self, wanted: &BTreeSet<IpAddr>) -> usize {
        let tracked: BTreeSet<IpAddr> = self.actuator.tracked_ips().into_iter().collect();
        let mut removed = 0;

        for ip in tracked.difference(wanted) {
            match self.actuator.remove_ip(&ip.to_string()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(subsystem = "net", ip = %ip, error = %e, "Cannot remove BE filter");
                    self.ctx.metrics.inc_actuator_errors("net", 1);
                }
            }
        }
        let missing: Vec<IpAddr> = wanted
            .iter()
            .filter(|ip| !self.actuator.is_classified(ip))
            .copied()
            .collect();
        for ip in missing {
            if let Err(e) = self.actuator.add_ip(&ip.to_string()).await {
                warn!(subsystem = "net", ip = %ip, error = %e, "Cannot add BE filter");
                self.ctx.metrics.inc_actuator_errors("net", 1);
            }
        }

        removed
    }
}
