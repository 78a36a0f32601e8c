//! Resource-limit actuators
//!
//! One actuator per resource. Each owns the in-process state of its
//! kernel mechanism and is driven by exactly one control loop, so none of
//! them needs interior locking.

pub mod blkio;
pub mod cpu;
pub mod net;


pub use blkio::{BlkioActuator, BlkioError, LimitOutcome};
pub use cpu::{CpuActuator, QuotaAdjustment, QuotaBounds, CPU_PERIOD_US};
pub use net::{NetActuator, NetError, NetStats};
