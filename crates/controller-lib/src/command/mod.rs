//! Command execution against the kernel resource-control surface
//!
//! All cgroup, tc and iptables mutations are issued as shell commands built
//! from validated, structured builders (see [`builder`]) and executed by a
//! [`CommandRunner`]. Two transports are interchangeable:
//! - [`SubprocessRunner`] runs each command through a local `bash -c`
//! - [`UnixSocketRunner`] sends `{id, command}` to a host-side command service

mod builder;
mod socket;
mod subprocess;

pub use builder::{
    dir_exists, read_file, write_file, BlockDevice, ClassId, Interface, MarkAction, MarkRule,
    SysPath, TcCommand, TcOp, U32Handle, U32_MAX_NODE,
};
pub use socket::UnixSocketRunner;
pub use subprocess::SubprocessRunner;

use crate::config::ControllerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from building or executing a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command argument: {0}")]
    InvalidArgument(String),

    #[error("failed to execute `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with exit code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("malformed response from command service: {0}")]
    Protocol(String),
}

/// A shell command produced by one of the builders
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShellCommand(String);

impl ShellCommand {
    pub(crate) fn new(command: String) -> Self {
        Self(command)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Executes shell commands and returns their standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a single command
    async fn run(&self, command: &ShellCommand) -> Result<String, CommandError>;

    /// Run commands in order, stopping at the first failure
    async fn run_all(&self, commands: &[ShellCommand]) -> Result<(), CommandError> {
        for command in commands {
            self.run(command).await?;
        }
        Ok(())
    }
}

/// Create the command transport selected by the configuration
pub fn create_runner(config: &ControllerConfig) -> Arc<dyn CommandRunner> {
    if config.uses_command_socket() {
        info!(socket = %config.command_socket.display(), "Using unix socket client for commands");
        Arc::new(UnixSocketRunner::new(&config.command_socket))
    } else {
        info!("Using subprocess client for commands");
        Arc::new(SubprocessRunner::new())
    }
}
