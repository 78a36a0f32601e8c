//! Network bandwidth actuator
//!
//! Egress: an HTB hierarchy on the external interface. Root class `1:1` is
//! capped at link bandwidth, BE class `1:10` at the current BE allowance.
//! BE packets are steered into `1:10` by an fw filter on mark 6, which an
//! iptables mangle rule sets per BE source address.
//!
//! Ingress: a CBQ hierarchy on the container interface with a bounded,
//! isolated BE class `2:10`. Each BE address gets its own u32 destination
//! filter so it can be removed without touching the others.

use crate::command::{
    read_file, write_file, ClassId, CommandError, CommandRunner, Interface, MarkAction, MarkRule,
    ShellCommand, SysPath, TcCommand, TcOp, U32Handle, U32_MAX_NODE,
};
use crate::config::NetControllerConfig;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Packet mark carried by BE traffic
pub const BE_MARK: u32 = 6;

const HTB_HANDLE: u16 = 1;
const CBQ_HANDLE: u16 = 2;
const HTB_ROOT_CLASS: ClassId = ClassId::new(HTB_HANDLE, 1);
const HTB_BE_CLASS: ClassId = ClassId::new(HTB_HANDLE, 10);
const CBQ_BE_CLASS: ClassId = ClassId::new(CBQ_HANDLE, 10);
const FW_FILTER_PRIO: u16 = 10;
const DST_FILTER_PRIO_V4: u16 = 16;
const DST_FILTER_PRIO_V6: u16 = 17;
const FIRST_U32_TABLE: u16 = 0x800;
const LAST_U32_TABLE: u16 = 0xfff;
const HTB_RATE_EST: &str = "/sys/module/sch_htb/parameters/htb_rate_est";

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid IP address {0:?}")]
    InvalidIp(String),

    #[error("duplicate filter for IP {0}")]
    DuplicateIp(IpAddr),

    #[error("no filter for IP {0}")]
    NotTracked(IpAddr),

    #[error("no free u32 filter handle for IP {0}")]
    HandlesExhausted(IpAddr),

    #[error("interface {0} not found in /proc/net/dev")]
    MissingInterface(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Interval-averaged throughput, in mbps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetStats {
    pub ingress_total_mbps: f64,
    pub ingress_be_mbps: f64,
    pub egress_total_mbps: f64,
    pub egress_be_mbps: f64,
    /// HTB rate-estimator readings per egress class minor
    pub egress_rates: BTreeMap<u16, f64>,
}

#[derive(Debug, Clone, Copy)]
struct ByteCounters {
    at: Instant,
    ingress_total: u64,
    egress_total: u64,
    ingress_be: u64,
    egress_be: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn prio(self) -> u16 {
        match self {
            Family::V4 => DST_FILTER_PRIO_V4,
            Family::V6 => DST_FILTER_PRIO_V6,
        }
    }
}

/// Classifier state of one BE address. Either half may be left behind by
/// a failed removal, in which case the address stays tracked.
#[derive(Debug, Clone, Copy)]
struct DstRule {
    handle: U32Handle,
    marked: bool,
    filtered: bool,
}

impl DstRule {
    fn is_complete(&self) -> bool {
        self.marked && self.filtered
    }
}

/// Owns the qdisc hierarchy and the per-address classifier rules
pub struct NetActuator {
    commands: Arc<dyn CommandRunner>,
    iface_ext: Interface,
    iface_cont: Interface,
    max_bw_mbps: f64,
    link_bw_mbps: f64,
    default_limit_mbps: f64,
    ips: BTreeMap<IpAddr, DstRule>,
    /// Root u32 table of each filter prio on the ingress qdisc
    tables: BTreeMap<Family, u16>,
    free_nodes: BTreeSet<u16>,
    next_node: u16,
    last: Option<ByteCounters>,
}

impl NetActuator {
    pub fn new(
        commands: Arc<dyn CommandRunner>,
        config: &NetControllerConfig,
    ) -> Result<Self, NetError> {
        Ok(Self {
            commands,
            iface_ext: Interface::new(&config.iface_ext)?,
            iface_cont: Interface::new(&config.iface_cont)?,
            max_bw_mbps: config.max_bw_mbps,
            link_bw_mbps: config.link_bw_mbps,
            default_limit_mbps: config.default_limit_mbps,
            ips: BTreeMap::new(),
            tables: BTreeMap::new(),
            free_nodes: BTreeSet::new(),
            next_node: 1,
            last: None,
        })
    }

    /// Reset iptables and both qdisc hierarchies, then take the first
    /// counter sample
    pub async fn init(&mut self) -> Result<(), NetError> {
        self.commands.run(&MarkRule::flush()).await?;

        let delete_ext = TcCommand::DeleteRoot {
            dev: self.iface_ext.clone(),
        }
        .command()?;
        // May fail when no root qdisc is installed yet
        if let Err(e) = self.commands.run(&delete_ext).await {
            debug!(error = %e, "No egress root qdisc to delete");
        }

        let htb_root = TcCommand::HtbRoot {
            dev: self.iface_ext.clone(),
            handle: HTB_HANDLE,
            default_minor: HTB_ROOT_CLASS.minor,
        }
        .command()?;

        // HTB has to be re-created after enabling the rate estimator for
        // class rates to show up in the statistics.
        let egress = vec![
            htb_root.clone(),
            write_file(&SysPath::new(HTB_RATE_EST)?, "1")?,
            delete_ext,
            htb_root,
            TcCommand::HtbClass {
                op: TcOp::Add,
                dev: self.iface_ext.clone(),
                classid: HTB_ROOT_CLASS,
                rate_mbps: self.link_bw_mbps,
                ceil_mbps: self.link_bw_mbps,
            }
            .command()?,
            TcCommand::HtbClass {
                op: TcOp::Add,
                dev: self.iface_ext.clone(),
                classid: HTB_BE_CLASS,
                rate_mbps: self.max_bw_mbps,
                ceil_mbps: self.max_bw_mbps,
            }
            .command()?,
            TcCommand::FwFilter {
                dev: self.iface_ext.clone(),
                parent: HTB_HANDLE,
                prio: FW_FILTER_PRIO,
                mark: BE_MARK,
                flowid: HTB_BE_CLASS,
            }
            .command()?,
        ];
        self.commands.run_all(&egress).await?;

        let delete_cont = TcCommand::DeleteRoot {
            dev: self.iface_cont.clone(),
        }
        .command()?;
        if let Err(e) = self.commands.run(&delete_cont).await {
            debug!(error = %e, "No ingress root qdisc to delete");
        }

        let ingress = vec![
            TcCommand::CbqRoot {
                dev: self.iface_cont.clone(),
                handle: CBQ_HANDLE,
                bandwidth_mbps: self.link_bw_mbps,
            }
            .command()?,
            TcCommand::CbqClass {
                op: TcOp::Replace,
                dev: self.iface_cont.clone(),
                classid: CBQ_BE_CLASS,
                rate_mbps: self.default_limit_mbps,
            }
            .command()?,
        ];
        self.commands.run_all(&ingress).await?;
        // Replacing the root qdisc and flushing mangle dropped every classifier
        self.ips.clear();
        self.tables.clear();
        self.free_nodes.clear();
        self.next_node = 1;

        self.last = Some(self.read_counters(Instant::now()).await?.0);
        info!(
            iface_ext = %self.iface_ext,
            iface_cont = %self.iface_cont,
            max_bw_mbps = self.max_bw_mbps,
            link_bw_mbps = self.link_bw_mbps,
            "Network qdiscs initialized"
        );
        Ok(())
    }

    pub fn max_bw_mbps(&self) -> f64 {
        self.max_bw_mbps
    }

    pub fn default_limit_mbps(&self) -> f64 {
        self.default_limit_mbps
    }

    /// Addresses with classifier state installed, including ones whose
    /// removal is still pending
    pub fn tracked_ips(&self) -> Vec<IpAddr> {
        self.ips.keys().copied().collect()
    }

    /// Whether both the mark rule and the filter of `addr` are installed
    pub fn is_classified(&self, addr: &IpAddr) -> bool {
        self.ips.get(addr).is_some_and(DstRule::is_complete)
    }

    /// Start classifying traffic of one BE address.
    ///
    /// A partially removed address gets its missing half reinstalled.
    pub async fn add_ip(&mut self, ip: &str) -> Result<(), NetError> {
        let addr = parse_ip(ip)?;
        let (mut rule, fresh) = match self.ips.get(&addr).copied() {
            Some(rule) if rule.is_complete() => return Err(NetError::DuplicateIp(addr)),
            Some(rule) => (rule, false),
            None => {
                let node = self.allocate_node().ok_or(NetError::HandlesExhausted(addr))?;
                let rule = DstRule {
                    handle: U32Handle::new(self.table_for(Family::of(addr)), node),
                    marked: false,
                    filtered: false,
                };
                (rule, true)
            }
        };

        if !rule.marked {
            let mark = self.mark_rule(MarkAction::Append, addr);
            if let Err(e) = self.commands.run(&mark.command()).await {
                if fresh {
                    self.free_nodes.insert(rule.handle.node);
                }
                return Err(e.into());
            }
            rule.marked = true;
        }

        if !rule.filtered {
            rule.handle.table = self.table_for(Family::of(addr));
            let filter = self.dst_filter(addr, rule.handle);
            let installed = match filter {
                Ok(filter) => self.commands.run(&filter).await.map_err(NetError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = installed {
                if fresh {
                    // Undo the mark so the next attempt starts clean
                    let undo = self.mark_rule(MarkAction::Delete, addr);
                    if let Err(undo_err) = self.commands.run(&undo.command()).await {
                        warn!(subsystem = "net", ip = %addr, error = %undo_err, "Failed to roll back mark rule");
                    }
                    self.free_nodes.insert(rule.handle.node);
                } else {
                    self.ips.insert(addr, rule);
                }
                return Err(e);
            }
            rule.filtered = true;
            self.tables.insert(Family::of(addr), rule.handle.table);
        }

        self.ips.insert(addr, rule);
        debug!(ip = %addr, handle = %rule.handle, "BE address classified");
        Ok(())
    }

    /// Stop classifying traffic of one BE address.
    ///
    /// Both the mark rule and the filter are attempted. Whatever fails to
    /// go away keeps the address tracked so the next call retries it.
    pub async fn remove_ip(&mut self, ip: &str) -> Result<(), NetError> {
        let addr = parse_ip(ip)?;
        let mut rule = *self.ips.get(&addr).ok_or(NetError::NotTracked(addr))?;
        let mut first_error: Option<NetError> = None;

        if rule.marked {
            let mark = self.mark_rule(MarkAction::Delete, addr);
            match self.commands.run(&mark.command()).await {
                Ok(_) => rule.marked = false,
                Err(e) => {
                    warn!(subsystem = "net", ip = %addr, error = %e, "Failed to delete mark rule");
                    first_error = Some(e.into());
                }
            }
        }

        if rule.filtered {
            let deleted = match self.delete_dst_filter(addr, rule.handle) {
                Ok(filter) => self.commands.run(&filter).await.map_err(NetError::from),
                Err(e) => Err(e),
            };
            match deleted {
                Ok(_) => {
                    rule.filtered = false;
                    self.ips.insert(addr, rule);
                    self.forget_empty_table();
                }
                Err(e) => {
                    warn!(
                        subsystem = "net",
                        ip = %addr,
                        handle = %rule.handle,
                        error = %e,
                        "Failed to delete BE filter"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            self.ips.insert(addr, rule);
            return Err(e);
        }

        self.ips.remove(&addr);
        self.free_nodes.insert(rule.handle.node);
        self.forget_empty_table();
        debug!(ip = %addr, handle = %rule.handle, "BE address released");
        Ok(())
    }

    fn allocate_node(&mut self) -> Option<u16> {
        if let Some(node) = self.free_nodes.pop_first() {
            return Some(node);
        }
        if self.next_node > U32_MAX_NODE {
            return None;
        }
        let node = self.next_node;
        self.next_node += 1;
        Some(node)
    }

    /// The kernel numbers u32 root tables from 0x800 in creation order and
    /// only drops one when it is the last u32 classifier left on the qdisc
    /// and holds no filters.
    fn table_for(&self, family: Family) -> u16 {
        if let Some(table) = self.tables.get(&family) {
            return *table;
        }
        (FIRST_U32_TABLE..=LAST_U32_TABLE)
            .find(|t| !self.tables.values().any(|used| used == t))
            .unwrap_or(FIRST_U32_TABLE)
    }

    fn forget_empty_table(&mut self) {
        if self.tables.len() == 1 && !self.ips.values().any(|rule| rule.filtered) {
            self.tables.clear();
        }
    }

    fn dst_filter(&self, addr: IpAddr, handle: U32Handle) -> Result<ShellCommand, NetError> {
        Ok(TcCommand::DstFilter {
            dev: self.iface_cont.clone(),
            parent: CBQ_HANDLE,
            prio: Family::of(addr).prio(),
            handle,
            dst: addr,
            flowid: CBQ_BE_CLASS,
        }
        .command()?)
    }

    fn delete_dst_filter(
        &self,
        addr: IpAddr,
        handle: U32Handle,
    ) -> Result<ShellCommand, NetError> {
        Ok(TcCommand::DeleteDstFilter {
            dev: self.iface_cont.clone(),
            parent: CBQ_HANDLE,
            prio: Family::of(addr).prio(),
            handle,
            dst: addr,
        }
        .command()?)
    }

    /// Replace the egress BE class rate
    pub async fn set_egress_limit(&self, mbps: f64) -> Result<(), NetError> {
        let command = TcCommand::HtbClass {
            op: TcOp::Replace,
            dev: self.iface_ext.clone(),
            classid: HTB_BE_CLASS,
            rate_mbps: mbps,
            ceil_mbps: mbps,
        }
        .command()?;
        self.commands.run(&command).await?;
        Ok(())
    }

    /// Replace the ingress BE class rate
    pub async fn set_ingress_limit(&self, mbps: f64) -> Result<(), NetError> {
        let command = TcCommand::CbqClass {
            op: TcOp::Replace,
            dev: self.iface_cont.clone(),
            classid: CBQ_BE_CLASS,
            rate_mbps: mbps,
        }
        .command()?;
        self.commands.run(&command).await?;
        Ok(())
    }

    /// Throughput since the previous call
    pub async fn current_stats(&mut self) -> Result<NetStats, NetError> {
        self.sample_at(Instant::now()).await
    }

    /// Throughput between the previous sample and `now`
    pub async fn sample_at(&mut self, now: Instant) -> Result<NetStats, NetError> {
        let (counters, egress_rates) = self.read_counters(now).await?;

        let stats = match self.last {
            Some(prev) => {
                let elapsed = counters.at.saturating_duration_since(prev.at).as_secs_f64();
                NetStats {
                    ingress_total_mbps: mbps(prev.ingress_total, counters.ingress_total, elapsed),
                    ingress_be_mbps: mbps(prev.ingress_be, counters.ingress_be, elapsed),
                    egress_total_mbps: mbps(prev.egress_total, counters.egress_total, elapsed),
                    egress_be_mbps: mbps(prev.egress_be, counters.egress_be, elapsed),
                    egress_rates,
                }
            }
            None => NetStats {
                egress_rates,
                ..Default::default()
            },
        };

        self.last = Some(counters);
        Ok(stats)
    }

    async fn read_counters(
        &self,
        at: Instant,
    ) -> Result<(ByteCounters, BTreeMap<u16, f64>), NetError> {
        let proc_net_dev = self
            .commands
            .run(&read_file(&SysPath::new("/proc/net/dev")?))
            .await?;
        let (ingress_total, egress_total) =
            parse_proc_net_dev(&proc_net_dev, self.iface_ext.as_str())
                .ok_or_else(|| NetError::MissingInterface(self.iface_ext.to_string()))?;

        let egress_classes = self
            .commands
            .run(
                &TcCommand::ShowClasses {
                    dev: self.iface_ext.clone(),
                }
                .command()?,
            )
            .await?;
        let ingress_classes = self
            .commands
            .run(
                &TcCommand::ShowClasses {
                    dev: self.iface_cont.clone(),
                }
                .command()?,
            )
            .await?;

        let egress = parse_tc_classes(&egress_classes);
        let ingress = parse_tc_classes(&ingress_classes);

        let counters = ByteCounters {
            at,
            ingress_total,
            egress_total,
            ingress_be: sent_bytes(&ingress, "cbq", CBQ_BE_CLASS),
            egress_be: sent_bytes(&egress, "htb", HTB_BE_CLASS),
        };
        Ok((counters, rates_by_minor(&egress, "htb", HTB_HANDLE)))
    }

    fn mark_rule(&self, action: MarkAction, source: IpAddr) -> MarkRule {
        MarkRule {
            action,
            iface: self.iface_cont.clone(),
            source,
            mark: BE_MARK,
        }
    }
}

fn parse_ip(ip: &str) -> Result<IpAddr, NetError> {
    ip.trim()
        .parse()
        .map_err(|_| NetError::InvalidIp(ip.to_string()))
}

fn mbps(before: u64, after: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    8.0 * after.saturating_sub(before) as f64 / (1_000_000.0 * elapsed_secs)
}

/// Statistics of one tc class from `tc -s class show`
#[derive(Debug, Clone, PartialEq)]
pub struct TcClassStats {
    pub kind: String,
    pub classid: ClassId,
    pub sent_bytes: u64,
    /// Rate-estimator reading, in mbps
    pub rate_mbps: Option<f64>,
}

fn class_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*class (\w+) (\d+):(\d*)").expect("valid class header regex")
    })
}

fn sent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*Sent (\d+) bytes").expect("valid sent regex"))
}

fn rate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*rate ([\d.]+)([KMG]?)bit").expect("valid rate regex"))
}

/// Parse `tc -s class show` output into per-class statistics.
///
/// Only the `Sent` and `rate` lines that follow a class header are read;
/// the configured rate on the header itself is ignored.
pub fn parse_tc_classes(text: &str) -> Vec<TcClassStats> {
    let mut classes: Vec<TcClassStats> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = class_header_re().captures(line) {
            let major = caps[2].parse().unwrap_or(0);
            // A bare `2:` is the root class, minor 0
            let minor = caps[3].parse().unwrap_or(0);
            classes.push(TcClassStats {
                kind: caps[1].to_string(),
                classid: ClassId::new(major, minor),
                sent_bytes: 0,
                rate_mbps: None,
            });
            continue;
        }

        let Some(current) = classes.last_mut() else {
            continue;
        };

        if let Some(caps) = sent_re().captures(line) {
            current.sent_bytes = caps[1].parse().unwrap_or(0);
        } else if let Some(caps) = rate_re().captures(line) {
            let value: f64 = caps[1].parse().unwrap_or(0.0);
            let multiplier = match &caps[2] {
                "K" => 1e3,
                "M" => 1e6,
                "G" => 1e9,
                _ => 1.0,
            };
            current.rate_mbps = Some(value * multiplier / 1_000_000.0);
        }
    }

    classes
}

/// Rate-estimator readings of the HTB classes under handle `1:`, keyed by
/// class minor, in mbps
pub fn parse_bw_stats(text: &str) -> BTreeMap<u16, f64> {
    rates_by_minor(&parse_tc_classes(text), "htb", HTB_HANDLE)
}

fn rates_by_minor(classes: &[TcClassStats], kind: &str, major: u16) -> BTreeMap<u16, f64> {
    classes
        .iter()
        .filter(|c| c.kind == kind && c.classid.major == major)
        .filter_map(|c| c.rate_mbps.map(|rate| (c.classid.minor, rate)))
        .collect()
}

fn sent_bytes(classes: &[TcClassStats], kind: &str, classid: ClassId) -> u64 {
    classes
        .iter()
        .find(|c| c.kind == kind && c.classid == classid)
        .map(|c| c.sent_bytes)
        .unwrap_or(0)
}

/// Receive and transmit byte counters of one interface from `/proc/net/dev`
pub fn parse_proc_net_dev(text: &str, iface: &str) -> Option<(u64, u64)> {
    text.lines().find_map(|line| {
        let (name, counters) = line.split_once(':')?;
        if name.trim() != iface {
            return None;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        let rx = fields.first()?.parse().ok()?;
        let tx = fields.get(8)?.parse().ok()?;
        Some((rx, tx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::time::Duration;

    const HTB_STATS: &str = "
class htb 1:10 root prio 0 rate 662Mbit ceil 662Mbit burst 1489b cburst 1489b
         Sent 0 bytes 0 pkt (dropped 0, overlimits 0 requeues 0)
         rate 123Mbit 0pps backlog 0b 0p requeues 0
         lended: 0 borrowed: 0 giants: 0
         tokens: 281 ctokens: 281

        class htb 1:1 root prio 0 rate 10Gbit ceil 10Gbit burst 0b cburst 0b
         Sent 2445535363 bytes 10892289 pkt (dropped 0, overlimits 0 requeues 0)
         rate 2395Kbit 1323pps backlog 0b 0p requeues 0
         lended: 10889769 borrowed: 0 giants: 0
         tokens: 13 ctokens: 13
";

    const CBQ_STATS: &str = "
class cbq 2: root rate 1Gbit (bounded,isolated) prio no-transmit
 Sent 71472933340 bytes 11208948 pkt (dropped 0, overlimits 0 requeues 0)
 backlog 0b 0p requeues 0
  borrowed 0 overactions 0 avgidle 125 undertime 0
class cbq 2:10 parent 2: rate 50Mbit (bounded,isolated) prio 5
 Sent 28586400957 bytes 7576847 pkt (dropped 2309, overlimits 15156382 requeues 0)
 backlog 0b 0p requeues 0
  borrowed 0 overactions 6378134 avgidle -5382 undertime 1.22595e+09
";

    const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 1000000    2000    0    0    0     0          0         0  3000000    4000    0    0    0     0       0          0
eth0.100:     5       1    0    0    0     0          0         0        7       1    0    0    0     0       0          0
";

    #[test]
    fn test_parse_bw_stats() {
        let rates = parse_bw_stats(HTB_STATS);
        assert_eq!(rates.get(&10), Some(&123.0));
        assert_eq!(rates.get(&1), Some(&2.395));
        assert_eq!(rates.len(), 2);
    }

    #[test]
    fn test_parse_bw_stats_plain_bits() {
        let text = "
class htb 1:10 root prio 0 rate 664Mbit ceil 664Mbit burst 1494b cburst 1494b
 Sent 0 bytes 0 pkt (dropped 0, overlimits 0 requeues 0)
 rate 0bit 0pps backlog 0b 0p requeues 0

class htb 1:1 root prio 0 rate 10Gbit ceil 10Gbit burst 0b cburst 0b
 Sent 233962506 bytes 628235 pkt (dropped 0, overlimits 0 requeues 0)
 rate 281672bit 89pps backlog 0b 0p requeues 0
";
        let rates = parse_bw_stats(text);
        assert_eq!(rates.get(&10), Some(&0.0));
        assert_eq!(rates.get(&1), Some(&0.281672));
    }

    #[test]
    fn test_parse_cbq_sent_bytes() {
        let classes = parse_tc_classes(CBQ_STATS);
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].classid, ClassId::new(2, 0));
        assert_eq!(sent_bytes(&classes, "cbq", CBQ_BE_CLASS), 28_586_400_957);
        // CBQ shows no rate estimator line
        assert!(classes.iter().all(|c| c.rate_mbps.is_none()));
    }

    #[test]
    fn test_parse_proc_net_dev_exact_interface() {
        assert_eq!(parse_proc_net_dev(PROC_NET_DEV, "eth0"), Some((1_000_000, 3_000_000)));
        assert_eq!(parse_proc_net_dev(PROC_NET_DEV, "eth0.100"), Some((5, 7)));
        assert_eq!(parse_proc_net_dev(PROC_NET_DEV, "eth1"), None);
    }

    fn actuator(runner: Arc<ScriptedRunner>) -> NetActuator {
        NetActuator::new(runner, &NetControllerConfig::default()).unwrap()
    }

    fn script_stats(runner: &ScriptedRunner) {
        runner.respond("cat /proc/net/dev", PROC_NET_DEV);
        runner.respond("tc -s class show dev eth0", HTB_STATS);
        runner.respond("tc -s class show dev docker0", CBQ_STATS);
    }

    #[tokio::test]
    async fn test_init_installs_hierarchies() {
        let runner = Arc::new(ScriptedRunner::default());
        script_stats(&runner);
        let mut net = actuator(runner.clone());

        net.init().await.unwrap();

        let log = runner.commands();
        assert_eq!(log[0], "iptables -t mangle -F");
        assert!(log.contains(&"echo \"1\" > /sys/module/sch_htb/parameters/htb_rate_est".to_string()));
        assert!(log.contains(
            &"tc class add dev eth0 parent 1: classid 1:10 htb rate 1000000kbit ceil 1000000kbit"
                .to_string()
        ));
        assert!(log.contains(
            &"tc filter add dev eth0 parent 1: protocol all prio 10 handle 6 fw flowid 1:10"
                .to_string()
        ));
        assert!(log.contains(
            &"tc class replace dev docker0 parent 2: classid 2:10 cbq rate 50000kbit allot 1500 prio 5 bounded isolated"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn test_init_fails_when_iptables_flush_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.fail("iptables -t mangle -F");
        let mut net = actuator(runner.clone());

        assert!(net.init().await.is_err());
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_add_remove_ip_round_trip() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());

        net.add_ip("172.17.0.5").await.unwrap();
        net.add_ip("172.17.0.6").await.unwrap();
        assert!(matches!(
            net.add_ip("172.17.0.5").await,
            Err(NetError::DuplicateIp(_))
        ));

        net.remove_ip("172.17.0.5").await.unwrap();
        assert_eq!(net.tracked_ips(), vec!["172.17.0.6".parse::<IpAddr>().unwrap()]);
        assert!(matches!(
            net.remove_ip("172.17.0.5").await,
            Err(NetError::NotTracked(_))
        ));

        // Only the filter of the removed address is deleted
        let log = runner.commands();
        assert!(log.contains(
            &"tc filter del dev docker0 parent 2: protocol ip prio 16 handle 800::1 u32".to_string()
        ));
        assert!(!log.iter().any(|c| c.contains("800::2 u32") && c.contains("filter del")));
    }

    #[tokio::test]
    async fn test_add_ip_rolls_back_mark_on_filter_failure() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.fail("tc filter add dev docker0");
        let mut net = actuator(runner.clone());

        assert!(net.add_ip("172.17.0.9").await.is_err());
        assert!(net.tracked_ips().is_empty());
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.starts_with("iptables -t mangle -D PREROUTING")));
    }

    fn filter_nodes(log: &[String]) -> Vec<u16> {
        log.iter()
            .filter(|c| c.starts_with("tc filter"))
            .filter_map(|c| c.split(" handle ").nth(1))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|handle| handle.rsplit("::").next())
            .map(|node| u16::from_str_radix(node, 16).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_filter_handles_recycled_under_churn() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());
        net.add_ip("172.17.0.2").await.unwrap();

        for i in 0..5000u32 {
            let ip = format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
            net.add_ip(&ip).await.unwrap();
            net.remove_ip(&ip).await.unwrap();
        }

        let log = runner.commands();
        let nodes = filter_nodes(&log);
        assert_eq!(nodes.len(), 1 + 2 * 5000);
        assert!(nodes.iter().all(|n| (1..=U32_MAX_NODE).contains(n)));
        assert_eq!(
            log.last().unwrap(),
            "tc filter del dev docker0 parent 2: protocol ip prio 16 handle 800::2 u32"
        );
        assert_eq!(net.tracked_ips(), vec!["172.17.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_filter_handles_exhausted() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());

        for i in 0..u32::from(U32_MAX_NODE) {
            let ip = format!("10.0.{}.{}", i >> 8, i & 0xff);
            net.add_ip(&ip).await.unwrap();
        }
        assert!(matches!(
            net.add_ip("10.1.0.0").await,
            Err(NetError::HandlesExhausted(_))
        ));

        // A released handle is handed out again
        net.remove_ip("10.0.0.7").await.unwrap();
        net.add_ip("10.1.0.0").await.unwrap();
        assert!(runner
            .commands()
            .last()
            .unwrap()
            .contains("handle 800::8 u32 match ip dst 10.1.0.0"));
    }

    #[tokio::test]
    async fn test_ipv6_filters_use_own_prio_and_table() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());

        net.add_ip("172.17.0.5").await.unwrap();
        net.add_ip("fd00::7").await.unwrap();
        assert_eq!(
            runner.commands().last().unwrap(),
            "tc filter add dev docker0 parent 2: protocol ipv6 prio 17 handle 801::2 u32 match ip6 dst fd00::7 flowid 2:10"
        );

        // Both classifiers outlive their filters while the other exists
        net.remove_ip("172.17.0.5").await.unwrap();
        net.remove_ip("fd00::7").await.unwrap();
        net.add_ip("fd00::8").await.unwrap();
        assert!(runner
            .commands()
            .last()
            .unwrap()
            .contains("protocol ipv6 prio 17 handle 801::1 u32"));
    }

    #[tokio::test]
    async fn test_sole_classifier_table_is_renumbered() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());

        net.add_ip("172.17.0.5").await.unwrap();
        net.remove_ip("172.17.0.5").await.unwrap();
        net.add_ip("fd00::7").await.unwrap();

        assert!(runner
            .commands()
            .last()
            .unwrap()
            .contains("protocol ipv6 prio 17 handle 800::1 u32"));
    }

    #[tokio::test]
    async fn test_remove_ip_keeps_tracking_when_mark_delete_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());
        let addr: IpAddr = "172.17.0.5".parse().unwrap();

        net.add_ip("172.17.0.5").await.unwrap();
        runner.fail("iptables -t mangle -D");

        assert!(net.remove_ip("172.17.0.5").await.is_err());
        // The filter still goes away and the address stays tracked for a retry
        let filter_dels = |log: &[String]| {
            log.iter()
                .filter(|c| c.starts_with("tc filter del"))
                .count()
        };
        assert_eq!(filter_dels(&runner.commands()), 1);
        assert_eq!(net.tracked_ips(), vec![addr]);
        assert!(!net.is_classified(&addr));

        runner.recover("iptables -t mangle -D");
        net.remove_ip("172.17.0.5").await.unwrap();

        let log = runner.commands();
        assert_eq!(filter_dels(&log), 1);
        assert_eq!(
            log.iter().filter(|c| c.starts_with("iptables -t mangle -D")).count(),
            2
        );
        assert!(net.tracked_ips().is_empty());
    }

    #[tokio::test]
    async fn test_add_ip_completes_half_removed_address() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());
        let addr: IpAddr = "172.17.0.5".parse().unwrap();

        net.add_ip("172.17.0.5").await.unwrap();
        runner.fail("tc filter del");
        assert!(net.remove_ip("172.17.0.5").await.is_err());
        assert_eq!(net.tracked_ips(), vec![addr]);

        // Only the deleted mark rule is reinstalled
        net.add_ip("172.17.0.5").await.unwrap();
        assert!(net.is_classified(&addr));

        let log = runner.commands();
        assert_eq!(log.iter().filter(|c| c.starts_with("tc filter add")).count(), 1);
        assert_eq!(
            log.iter().filter(|c| c.starts_with("iptables -t mangle -A")).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_invalid_ip_rejected() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut net = actuator(runner.clone());
        assert!(matches!(
            net.add_ip("172.17.0.5; reboot").await,
            Err(NetError::InvalidIp(_))
        ));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_sample_computes_interval_throughput() {
        let runner = Arc::new(ScriptedRunner::default());
        script_stats(&runner);
        let mut net = actuator(runner.clone());

        let start = Instant::now();
        let first = net.sample_at(start).await.unwrap();
        assert_eq!(first.egress_total_mbps, 0.0);
        assert_eq!(first.egress_rates.get(&10), Some(&123.0));

        // 1 MB more received, 2 MB more sent over two seconds
        runner.respond(
            "cat /proc/net/dev",
            &PROC_NET_DEV.replace("1000000    2000", "2000000    2000")
                .replace("3000000    4000", "5000000    4000"),
        );
        let second = net
            .sample_at(start + Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(second.ingress_total_mbps, 4.0);
        assert_eq!(second.egress_total_mbps, 8.0);
        assert_eq!(second.egress_be_mbps, 0.0);
    }

    #[tokio::test]
    async fn test_limits_use_replace() {
        let runner = Arc::new(ScriptedRunner::default());
        let net = actuator(runner.clone());

        net.set_egress_limit(250.0).await.unwrap();
        net.set_ingress_limit(250.0).await.unwrap();

        let log = runner.commands();
        assert_eq!(
            log[0],
            "tc class replace dev eth0 parent 1: classid 1:10 htb rate 250000kbit ceil 250000kbit"
        );
        assert!(log[1].starts_with("tc class replace dev docker0 parent 2: classid 2:10 cbq rate 250000kbit"));
    }
}
