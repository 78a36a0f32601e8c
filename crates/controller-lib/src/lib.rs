//! Node-local controller co-locating latency-critical (HP) and
//! best-effort (BE) workloads
//!
//! This crate provides the core functionality for:
//! - Tracking the pods and containers scheduled on the node
//! - Arbitrating CPU, network bandwidth and block I/O between HP and BE
//! - Executing privileged cgroup and traffic-control commands
//! - Health checks, metrics and per-cycle records

pub mod actuator;
pub mod command;
pub mod config;
pub mod context;
pub mod control;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod signal;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, ControllerConfig, ModeKind};
pub use context::{AppContext, NodeInfo};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use registry::WorkloadRegistry;
