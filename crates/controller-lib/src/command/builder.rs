//! Structured builders for iptables, tc and sysfs/cgroup commands
//!
//! Every argument that ends up in a shell command is validated when the
//! typed value is constructed, so rendering can never produce a malformed
//! or injected command line.

use super::{CommandError, ShellCommand};
use std::fmt;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

/// Maximum length of a Linux interface name
const IFNAMSIZ: usize = 15;

/// Network interface name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface(String);

impl Interface {
    pub fn new(name: &str) -> Result<Self, CommandError> {
        let valid = !name.is_empty()
            && name.len() <= IFNAMSIZ
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(CommandError::InvalidArgument(format!(
                "invalid interface name {:?}",
                name
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block device identifier in `major:minor` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDevice {
    pub major: u32,
    pub minor: u32,
}

impl BlockDevice {
    pub fn parse(s: &str) -> Result<Self, CommandError> {
        let invalid = || CommandError::InvalidArgument(format!("invalid block device {:?}", s));
        let (major, minor) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Absolute path under sysfs or cgroupfs that is safe to put on a command line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SysPath(PathBuf);

impl SysPath {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CommandError> {
        let path = path.as_ref();
        let text = path.to_string_lossy();
        let safe_chars = text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':'));
        let no_parent = path.components().all(|c| !matches!(c, Component::ParentDir));

        if path.is_absolute() && safe_chars && no_parent {
            Ok(Self(path.to_path_buf()))
        } else {
            Err(CommandError::InvalidArgument(format!("unsafe path {:?}", text)))
        }
    }

    /// Append a relative fragment, re-validating the result
    pub fn join(&self, fragment: &str) -> Result<Self, CommandError> {
        Self::new(self.0.join(fragment.trim_start_matches('/')))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SysPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// `echo "<value>" > <path>`
pub fn write_file(path: &SysPath, value: &str) -> Result<ShellCommand, CommandError> {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | ':' | '.' | '_' | '-'));
    if !safe {
        return Err(CommandError::InvalidArgument(format!(
            "unsafe value {:?} for {}",
            value, path
        )));
    }
    Ok(ShellCommand::new(format!("echo \"{}\" > {}", value, path)))
}

/// `cat <path>`
pub fn read_file(path: &SysPath) -> ShellCommand {
    ShellCommand::new(format!("cat {}", path))
}

/// `test -d <path>`
pub fn dir_exists(path: &SysPath) -> ShellCommand {
    ShellCommand::new(format!("test -d {}", path))
}

/// Whether a mark rule is appended or deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAction {
    Append,
    Delete,
}

/// Mangle-table rule marking packets from one source address
#[derive(Debug, Clone)]
pub struct MarkRule {
    pub action: MarkAction,
    pub iface: Interface,
    pub source: IpAddr,
    pub mark: u32,
}

impl MarkRule {
    pub fn command(&self) -> ShellCommand {
        let binary = match self.source {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        };
        let flag = match self.action {
            MarkAction::Append => "-A",
            MarkAction::Delete => "-D",
        };
        ShellCommand::new(format!(
            "{} -t mangle {} PREROUTING -i {} -s {} -j MARK --set-mark {}",
            binary, flag, self.iface, self.source, self.mark
        ))
    }

    /// Flush every rule in the mangle table
    pub fn flush() -> ShellCommand {
        ShellCommand::new("iptables -t mangle -F".to_string())
    }
}

/// tc class or qdisc handle, `major:minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId {
    pub major: u16,
    pub minor: u16,
}

impl ClassId {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Largest node id of a u32 filter key
pub const U32_MAX_NODE: u16 = 0xfff;

/// u32 filter key handle, `table::node`, rendered in hex the way tc parses it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct U32Handle {
    pub table: u16,
    pub node: u16,
}

impl U32Handle {
    pub const fn new(table: u16, node: u16) -> Self {
        Self { table, node }
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.node == 0 || self.node > U32_MAX_NODE || self.table == 0 || self.table > 0xfff {
            return Err(CommandError::InvalidArgument(format!(
                "u32 handle {} out of range",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for U32Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}::{:x}", self.table, self.node)
    }
}

/// `add` fails on an existing object, `replace` creates or overwrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcOp {
    Add,
    Replace,
}

impl fmt::Display for TcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcOp::Add => f.write_str("add"),
            TcOp::Replace => f.write_str("replace"),
        }
    }
}

/// Traffic-control commands used by the network actuator
#[derive(Debug, Clone)]
pub enum TcCommand {
    DeleteRoot {
        dev: Interface,
    },
    HtbRoot {
        dev: Interface,
        handle: u16,
        default_minor: u16,
    },
    CbqRoot {
        dev: Interface,
        handle: u16,
        bandwidth_mbps: f64,
    },
    HtbClass {
        op: TcOp,
        dev: Interface,
        classid: ClassId,
        rate_mbps: f64,
        ceil_mbps: f64,
    },
    CbqClass {
        op: TcOp,
        dev: Interface,
        classid: ClassId,
        rate_mbps: f64,
    },
    FwFilter {
        dev: Interface,
        parent: u16,
        prio: u16,
        mark: u32,
        flowid: ClassId,
    },
    DstFilter {
        dev: Interface,
        parent: u16,
        prio: u16,
        handle: U32Handle,
        dst: IpAddr,
        flowid: ClassId,
    },
    DeleteDstFilter {
        dev: Interface,
        parent: u16,
        prio: u16,
        handle: U32Handle,
        dst: IpAddr,
    },
    ShowClasses {
        dev: Interface,
    },
}

impl TcCommand {
    pub fn command(&self) -> Result<ShellCommand, CommandError> {
        let text = match self {
            TcCommand::DeleteRoot { dev } => format!("tc qdisc del dev {} root", dev),
            TcCommand::HtbRoot {
                dev,
                handle,
                default_minor,
            } => format!(
                "tc qdisc add dev {} root handle {}: htb default {}",
                dev, handle, default_minor
            ),
            TcCommand::CbqRoot {
                dev,
                handle,
                bandwidth_mbps,
            } => format!(
                "tc qdisc replace dev {} root handle {}: cbq avpkt 1000 bandwidth {}",
                dev,
                handle,
                rate(*bandwidth_mbps)?
            ),
            TcCommand::HtbClass {
                op,
                dev,
                classid,
                rate_mbps,
                ceil_mbps,
            } => format!(
                "tc class {} dev {} parent {}: classid {} htb rate {} ceil {}",
                op,
                dev,
                classid.major,
                classid,
                rate(*rate_mbps)?,
                rate(*ceil_mbps)?
            ),
            TcCommand::CbqClass {
                op,
                dev,
                classid,
                rate_mbps,
            } => format!(
                "tc class {} dev {} parent {}: classid {} cbq rate {} allot 1500 prio 5 bounded isolated",
                op,
                dev,
                classid.major,
                classid,
                rate(*rate_mbps)?
            ),
            TcCommand::FwFilter {
                dev,
                parent,
                prio,
                mark,
                flowid,
            } => format!(
                "tc filter add dev {} parent {}: protocol all prio {} handle {} fw flowid {}",
                dev, parent, prio, mark, flowid
            ),
            TcCommand::DstFilter {
                dev,
                parent,
                prio,
                handle,
                dst,
                flowid,
            } => {
                handle.validate()?;
                let (protocol, selector) = ip_selector(dst);
                format!(
                    "tc filter add dev {} parent {}: protocol {} prio {} handle {} u32 match {} dst {} flowid {}",
                    dev, parent, protocol, prio, handle, selector, dst, flowid
                )
            }
            TcCommand::DeleteDstFilter {
                dev,
                parent,
                prio,
                handle,
                dst,
            } => {
                handle.validate()?;
                let (protocol, _) = ip_selector(dst);
                format!(
                    "tc filter del dev {} parent {}: protocol {} prio {} handle {} u32",
                    dev, parent, protocol, prio, handle
                )
            }
            TcCommand::ShowClasses { dev } => format!("tc -s class show dev {}", dev),
        };
        Ok(ShellCommand::new(text))
    }
}

fn ip_selector(addr: &IpAddr) -> (&'static str, &'static str) {
    match addr {
        IpAddr::V4(_) => ("ip", "ip"),
        IpAddr::V6(_) => ("ipv6", "ip6"),
    }
}

/// Render a rate in kbit, which keeps sub-mbit precision
fn rate(mbps: f64) -> Result<String, CommandError> {
    if !mbps.is_finite() || mbps <= 0.0 {
        return Err(CommandError::InvalidArgument(format!("invalid rate {} mbps", mbps)));
    }
    let kbit = ((mbps * 1000.0).round() as u64).max(1);
    Ok(format!("{}kbit", kbit))
}
