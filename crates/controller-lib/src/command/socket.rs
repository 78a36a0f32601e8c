//! Unix socket command transport
//!
//! Talks to a host-side command service. Each request opens a fresh
//! connection, sends `{"id": <uuid>, "command": <string>}` and reads back
//! `{"exit_code": <int>, "stdout": <string>, "stderr": <string>}`.

use super::{CommandError, CommandRunner, ShellCommand};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    id: String,
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Sends commands to the command service over a unix stream socket
#[derive(Debug, Clone)]
pub struct UnixSocketRunner {
    path: PathBuf,
    timeout: Duration,
}

impl UnixSocketRunner {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, command: &ShellCommand) -> Result<CommandResponse, CommandError> {
        let io_err = |source| CommandError::Io {
            command: command.to_string(),
            source,
        };

        let request = CommandRequest {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.as_str(),
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| CommandError::Protocol(e.to_string()))?;

        let mut stream = UnixStream::connect(&self.path).await.map_err(io_err)?;
        stream.write_all(&payload).await.map_err(io_err)?;

        // The service may answer without waiting for EOF, so parse as soon as
        // a complete document has arrived.
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Ok(response) = serde_json::from_slice::<CommandResponse>(&buf) {
                return Ok(response);
            }
        }

        serde_json::from_slice(&buf).map_err(|e| CommandError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl CommandRunner for UnixSocketRunner {
    async fn run(&self, command: &ShellCommand) -> Result<String, CommandError> {
        trace!(command = %command, socket = %self.path.display(), "Sending command");

        let response = tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| CommandError::Protocol(format!("timed out running `{}`", command)))??;

        if response.exit_code != 0 {
            return Err(CommandError::Failed {
                command: command.to_string(),
                exit_code: response.exit_code,
                stderr: response.stderr,
            });
        }

        Ok(response.stdout)
    }
}
