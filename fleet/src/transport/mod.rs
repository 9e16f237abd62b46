//! Remote command transport
//!
//! The pipeline, connection tester and rollback controller reach remote
//! hosts only through [`RemoteExecutor`].

pub mod simulated;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::FleetError;
use crate::models::target::ServerTarget;

/// Output of a finished remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The most useful single line for a failure message
    pub fn failure_reason(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("command exited with status {}", self.exit_code))
    }
}

/// Transport used to reach a remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Check reachability and credentials.
    ///
    /// `Ok(false)` means the host answered but rejected the credentials;
    /// `Err` means it could not be reached at all.
    async fn check_connection(&self, target: &ServerTarget) -> Result<bool, FleetError>;

    /// Run `command` and collect its output. A non-zero exit is not an error
    /// at this level.
    async fn exec(&self, target: &ServerTarget, command: &str)
        -> Result<CommandOutput, FleetError>;

    /// Run `command`, sending each output line on `lines` as it appears.
    /// Stderr lines are prefixed with `STDERR: `.
    async fn exec_streaming(
        &self,
        target: &ServerTarget,
        command: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<CommandOutput, FleetError> {
        let output = self.exec(target, command).await?;
        for line in output.stdout.lines() {
            let _ = lines.send(line.to_string()).await;
        }
        for line in output.stderr.lines() {
            let _ = lines.send(format!("STDERR: {}", line)).await;
        }
        Ok(output)
    }
}
