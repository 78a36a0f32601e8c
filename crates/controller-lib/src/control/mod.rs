//! Control loops
//!
//! Three independent periodic loops arbitrate CPU, network bandwidth and
//! block I/O between HP and BE workloads. Each owns its actuator; the only
//! state they share is the [`AppContext`](crate::context::AppContext).

pub mod blkio;
pub mod cpu;
pub mod net;

pub use blkio::{be_iops_limit, BlkioController};
pub use cpu::{decide, CpuAction, CpuController};
pub use net::{be_bandwidth_allowance, NetController};

use crate::context::AppContext;

/// Why a cycle did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The global controller switch is off
    SwitchedOff,
    /// The resource's own `disabled` override is set
    Disabled,
}

/// Gate shared by all loops: the published switch, then the per-resource override
pub(crate) fn gate(ctx: &AppContext, resource_disabled: bool) -> Option<Skip> {
    if !ctx.is_enabled() {
        Some(Skip::SwitchedOff)
    } else if resource_disabled {
        Some(Skip::Disabled)
    } else {
        None
    }
}
