//! Local subprocess command transport

use super::{CommandError, CommandRunner, ShellCommand};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// Runs commands with `/bin/bash -c` on the local host
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    shell: String,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
        }
    }

    /// Use a different shell binary (for testing)
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, command: &ShellCommand) -> Result<String, CommandError> {
        trace!(command = %command, "Running command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command.as_str())
            .output()
            .await
            .map_err(|source| CommandError::Io {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
