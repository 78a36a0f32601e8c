//! Block I/O (IOPS) actuator
//!
//! Throttles BE cgroups on a single block device through the blkio
//! throttle files. The BE cap is split evenly across tracked workloads.

use crate::command::{
    dir_exists, read_file, write_file, BlockDevice, CommandError, CommandRunner, SysPath,
};
use crate::config::BlkioControllerConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const READ_IOPS_FILE: &str = "blkio.throttle.read_iops_device";
const WRITE_IOPS_FILE: &str = "blkio.throttle.write_iops_device";
const IO_SERVICED_FILE: &str = "blkio.throttle.io_serviced";

#[derive(Debug, Error)]
pub enum BlkioError {
    #[error("duplicate blkio throttling request for {0}")]
    Duplicate(String),

    #[error("workload {0} is not throttled")]
    NotTracked(String),

    #[error("blkio limit {requested} is not below the maximum {max}")]
    LimitTooHigh { requested: u64, max: u64 },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Result of pushing a limit to every tracked workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOutcome {
    pub applied: usize,
    pub skipped: usize,
    /// Per-workload (read, write) cap that was written
    pub per_workload: (u64, u64),
}

pub struct BlkioActuator {
    commands: Arc<dyn CommandRunner>,
    root: SysPath,
    device: BlockDevice,
    max_rd_iops: u64,
    max_wr_iops: u64,
    keys: BTreeSet<String>,
}

impl BlkioActuator {
    pub fn new(
        commands: Arc<dyn CommandRunner>,
        config: &BlkioControllerConfig,
    ) -> Result<Self, BlkioError> {
        Ok(Self {
            commands,
            root: SysPath::new(&config.cgroup_root)?,
            device: BlockDevice::parse(&config.block_dev)?,
            max_rd_iops: config.max_rd_iops,
            max_wr_iops: config.max_wr_iops,
            keys: BTreeSet::new(),
        })
    }

    pub fn max_iops(&self) -> (u64, u64) {
        (self.max_rd_iops, self.max_wr_iops)
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn add_workload(&mut self, key: &str) -> Result<(), BlkioError> {
        if self.keys.contains(key) {
            return Err(BlkioError::Duplicate(key.to_string()));
        }
        // Reject keys that cannot form a safe path before tracking them
        self.root.join(key)?;
        self.keys.insert(key.to_string());
        Ok(())
    }

    pub fn remove_workload(&mut self, key: &str) -> Result<(), BlkioError> {
        if !self.keys.remove(key) {
            return Err(BlkioError::NotTracked(key.to_string()));
        }
        Ok(())
    }

    /// Split the BE caps evenly and write them to every tracked workload.
    ///
    /// Each workload gets at least 1 IOPS, since writing 0 would lift the
    /// throttle instead of tightening it.
    pub async fn set_iops_limit(&self, riops: u64, wiops: u64) -> Result<LimitOutcome, BlkioError> {
        if riops >= self.max_rd_iops {
            return Err(BlkioError::LimitTooHigh {
                requested: riops,
                max: self.max_rd_iops,
            });
        }
        if wiops >= self.max_wr_iops {
            return Err(BlkioError::LimitTooHigh {
                requested: wiops,
                max: self.max_wr_iops,
            });
        }
        if self.keys.is_empty() {
            return Ok(LimitOutcome::default());
        }

        let n = self.keys.len() as u64;
        let per_read = (riops / n).max(1);
        let per_write = (wiops / n).max(1);

        let mut outcome = LimitOutcome {
            per_workload: (per_read, per_write),
            ..Default::default()
        };
        for key in &self.keys {
            if self.write_limits(key, per_read, per_write).await {
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        debug!(
            riops,
            wiops,
            per_read,
            per_write,
            workloads = n,
            "Blkio limits applied"
        );
        Ok(outcome)
    }

    /// Remove the throttle rule for the device from every tracked workload
    pub async fn clear_iops_limit(&self) -> LimitOutcome {
        let mut outcome = LimitOutcome::default();
        for key in &self.keys {
            if self.write_limits(key, 0, 0).await {
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        outcome
    }

    /// Cumulative (read, write) operations serviced on the device.
    ///
    /// Works for any cgroup key, tracked or not. A missing stats file reads
    /// as zero.
    pub async fn get_iops_used(&self, key: &str) -> Result<(u64, u64), BlkioError> {
        let path = self.root.join(key)?.join(IO_SERVICED_FILE)?;
        match self.commands.run(&read_file(&path)).await {
            Ok(text) => Ok(parse_io_serviced(&text, self.device)),
            Err(CommandError::Failed { .. }) => Ok((0, 0)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_limits(&self, key: &str, read: u64, write: u64) -> bool {
        match self.try_write_limits(key, read, write).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    subsystem = "blkio",
                    cgroup = %key,
                    error = %e,
                    "Skipping workload, cannot write blkio limits"
                );
                false
            }
        }
    }

    async fn try_write_limits(&self, key: &str, read: u64, write: u64) -> Result<(), CommandError> {
        let dir = self.root.join(key)?;
        self.commands.run(&dir_exists(&dir)).await?;

        let commands = [
            write_file(&dir.join(READ_IOPS_FILE)?, &format!("{} {}", self.device, read))?,
            write_file(&dir.join(WRITE_IOPS_FILE)?, &format!("{} {}", self.device, write))?,
        ];
        self.commands.run_all(&commands).await
    }
}

/// Read and write counts for one device from `blkio.throttle.io_serviced`
pub fn parse_io_serviced(text: &str, device: BlockDevice) -> (u64, u64) {
    let device = device.to_string();
    let mut read = 0;
    let mut write = 0;

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(dev), Some(op), Some(value)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if dev != device {
            continue;
        }
        match op {
            "Read" => read = value.parse().unwrap_or(0),
            "Write" => write = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    (read, write)
}
