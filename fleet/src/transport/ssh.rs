//! Remote execution through the system OpenSSH client

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::FleetError;
use crate::models::target::ServerTarget;
use crate::storage::settings::TransportSettings;
use crate::transport::{CommandOutput, RemoteExecutor};

/// Exit status ssh itself uses for connection and authentication failures
const SSH_ERROR_EXIT: i32 = 255;

/// [`RemoteExecutor`] backed by the `ssh` binary.
///
/// Runs in batch mode so a missing key never blocks on a password prompt,
/// and with strict host key checking unless disabled in settings.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    settings: TransportSettings,
}

impl SshExecutor {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    fn command(&self, target: &ServerTarget, remote_command: &str) -> Command {
        let host_key_policy = if self.settings.strict_host_keys {
            "StrictHostKeyChecking=yes"
        } else {
            "StrictHostKeyChecking=accept-new"
        };

        let mut cmd = Command::new(&self.settings.ssh_binary);
        cmd.arg("-i")
            .arg(expand_home(&target.key_locator))
            .args(["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.connect_timeout_secs))
            .arg("-o")
            .arg(host_key_policy)
            .arg(target.address())
            .arg("--")
            .arg(remote_command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn check_ssh_exit(target: &ServerTarget, output: CommandOutput) -> Result<CommandOutput, FleetError> {
        if output.exit_code == SSH_ERROR_EXIT {
            return Err(FleetError::ConnectionError(format!(
                "{}: {}",
                target.address(),
                output.failure_reason()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn check_connection(&self, target: &ServerTarget) -> Result<bool, FleetError> {
        let output = self
            .command(target, "true")
            .output()
            .await
            .map_err(|e| FleetError::ConnectionError(format!("failed to run ssh: {}", e)))?;

        let output = to_command_output(output.status.code(), &output.stdout, &output.stderr);
        if output.success() {
            debug!("SSH connection test successful: {}", target.address());
            return Ok(true);
        }

        let stderr = output.stderr.to_lowercase();
        if stderr.contains("permission denied") || stderr.contains("authentication") {
            warn!("SSH authentication failed: {}", target.address());
            return Ok(false);
        }

        Err(FleetError::ConnectionError(format!(
            "{}: {}",
            target.address(),
            output.failure_reason()
        )))
    }

    async fn exec(
        &self,
        target: &ServerTarget,
        command: &str,
    ) -> Result<CommandOutput, FleetError> {
        debug!("Executing remote command on {}", target.address());

        let output = self
            .command(target, command)
            .output()
            .await
            .map_err(|e| FleetError::ConnectionError(format!("failed to run ssh: {}", e)))?;

        let output = to_command_output(output.status.code(), &output.stdout, &output.stderr);
        debug!(
            "Remote command on {} exited with {}",
            target.address(),
            output.exit_code
        );
        Self::check_ssh_exit(target, output)
    }

    async fn exec_streaming(
        &self,
        target: &ServerTarget,
        command: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<CommandOutput, FleetError> {
        debug!("Streaming remote command on {}", target.address());

        let mut child = self
            .command(target, command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FleetError::ConnectionError(format!("failed to run ssh: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr) = tokio::join!(
            forward_lines(stdout, "", lines.clone()),
            forward_lines(stderr, "STDERR: ", lines),
        );

        let status = child.wait().await?;
        let output = CommandOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        };
        Self::check_ssh_exit(target, output)
    }
}

/// Read `reader` line by line, forwarding each line and returning the full text
async fn forward_lines<R>(reader: Option<R>, prefix: &str, lines: mpsc::Sender<String>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        // keep draining the pipe even if nobody listens any more
        let _ = lines.send(format!("{}{}", prefix, line)).await;
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

fn to_command_output(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> CommandOutput {
    CommandOutput {
        stdout: String::from_utf8_lossy(stdout).to_string(),
        stderr: String::from_utf8_lossy(stderr).to_string(),
        exit_code: code.unwrap_or(-1),
    }
}

/// Expand a leading `~/` in a key path
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
