//! CPU quota actuator
//!
//! BE containers are throttled through CFS bandwidth control. Every write
//! first makes sure the container runs with the canonical period so that
//! quotas are comparable across containers.

use crate::models::CpuSettings;
use crate::registry::{RegistrySnapshot, WorkloadRegistry};
use crate::runtime::{ContainerRuntime, CpuUpdate, RuntimeError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Canonical CFS period in microseconds
pub const CPU_PERIOD_US: i64 = 100_000;

/// Admissible BE quota range for one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBounds {
    pub min: i64,
    pub max: i64,
}

impl QuotaBounds {
    /// Bounds as fractions of the node's total CPU time per period
    pub fn from_fractions(cpu_count: u32, min_fraction: f64, max_fraction: f64) -> Self {
        let total = cpu_count as f64 * CPU_PERIOD_US as f64;
        Self {
            min: (total * min_fraction) as i64,
            max: (total * max_fraction) as i64,
        }
    }

    pub fn contains(&self, quota: i64) -> bool {
        quota >= self.min && quota <= self.max
    }

    pub fn clamp(&self, quota: i64) -> i64 {
        quota.clamp(self.min, self.max)
    }
}

/// Scale a quota by `rate` and clamp the result into `bounds`
pub fn scale_quota(old: i64, rate: f64, bounds: QuotaBounds) -> i64 {
    let scaled = old as f64 * rate;
    if !scaled.is_finite() {
        return bounds.min;
    }
    bounds.clamp(scaled as i64)
}

/// Outcome of applying a quota change to every BE container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaAdjustment {
    pub updated: usize,
    pub failed: usize,
    /// Sum of BE quotas after the change
    pub total_quota: i64,
}

/// Writes CPU quotas of BE containers
pub struct CpuActuator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<WorkloadRegistry>,
    bounds: QuotaBounds,
}

impl CpuActuator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<WorkloadRegistry>,
        bounds: QuotaBounds,
    ) -> Self {
        Self {
            runtime,
            registry,
            bounds,
        }
    }

    pub fn bounds(&self) -> QuotaBounds {
        self.bounds
    }

    /// Write a quota to one container, forcing the canonical period first
    pub async fn set_quota(
        &self,
        container_id: &str,
        current: CpuSettings,
        quota: i64,
    ) -> Result<CpuSettings, RuntimeError> {
        let update = CpuUpdate {
            period: (current.period != CPU_PERIOD_US).then_some(CPU_PERIOD_US),
            quota: Some(quota),
        };
        self.runtime.update_cpu(container_id, update).await?;
        Ok(CpuSettings {
            period: CPU_PERIOD_US,
            quota,
        })
    }

    /// Multiply every BE quota by `1 + growth_ratio * slack`
    pub async fn grow_be(
        &self,
        snapshot: &RegistrySnapshot,
        growth_ratio: f64,
        slack: f64,
    ) -> QuotaAdjustment {
        let rate = 1.0 + growth_ratio * slack;
        debug!(rate, "Growing BE quota");
        self.apply(snapshot, |old| scale_quota(old, rate, self.bounds))
            .await
    }

    /// Multiply every BE quota by `1 + shrink_ratio * excess`, never expanding
    pub async fn shrink_be(
        &self,
        snapshot: &RegistrySnapshot,
        shrink_ratio: f64,
        excess: f64,
    ) -> QuotaAdjustment {
        let rate = (1.0 + shrink_ratio * excess).min(1.0);
        debug!(rate, "Shrinking BE quota");
        self.apply(snapshot, |old| scale_quota(old, rate, self.bounds))
            .await
    }

    /// Set every BE quota to the minimum
    pub async fn reset_be(&self, snapshot: &RegistrySnapshot) -> QuotaAdjustment {
        let min = self.bounds.min;
        self.apply(snapshot, |_| min).await
    }

    async fn apply<F>(&self, snapshot: &RegistrySnapshot, next_quota: F) -> QuotaAdjustment
    where
        F: Fn(i64) -> i64,
    {
        let mut adjustment = QuotaAdjustment::default();

        for (pod, container) in snapshot.be_containers() {
            let quota = next_quota(container.cpu.quota);
            match self.set_quota(&container.id, container.cpu, quota).await {
                Ok(cpu) => {
                    self.registry
                        .set_container_cpu(&container.pod_key, &container.id, cpu)
                        .await;
                    adjustment.updated += 1;
                    adjustment.total_quota += cpu.quota;
                }
                Err(e) => {
                    warn!(
                        subsystem = "cpu",
                        pod = %pod.key(),
                        container_id = %container.id,
                        error = %e,
                        "Failed to update container quota"
                    );
                    adjustment.failed += 1;
                    adjustment.total_quota += container.cpu.quota.max(0);
                }
            }
        }

        adjustment
    }
}
