//! In-process simulated transport
//!
//! Used for dry runs and for exercising the pipeline without real hosts.
//! Every host succeeds by default; per-host rules inject auth denial,
//! unreachability, command failures and latency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::FleetError;
use crate::models::target::ServerTarget;
use crate::transport::{CommandOutput, RemoteExecutor};

const DEFAULT_NODE_VERSION: &str = "v22.12.0";

#[derive(Debug, Clone, Default)]
struct HostRules {
    auth_denied: bool,
    unreachable: Option<String>,
    node_version: Option<String>,
    /// (command fragment, stderr) pairs; matching commands exit 1
    failures: Vec<(String, String)>,
    /// (command fragment, delay) pairs
    delays: Vec<(String, Duration)>,
}

/// [`RemoteExecutor`] that never leaves the process
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    rules: HashMap<String, HostRules>,
    latency: Duration,
    history: Mutex<HashMap<String, Vec<String>>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every command
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Host answers but rejects the credentials
    pub fn deny_auth(mut self, host: &str) -> Self {
        self.host(host).auth_denied = true;
        self
    }

    /// Host cannot be reached at all
    pub fn unreachable(mut self, host: &str, reason: &str) -> Self {
        self.host(host).unreachable = Some(reason.to_string());
        self
    }

    /// Version reported by `node --version`
    pub fn node_version(mut self, host: &str, version: &str) -> Self {
        self.host(host).node_version = Some(version.to_string());
        self
    }

    /// Commands containing `fragment` exit 1 with `stderr`
    pub fn fail_command(mut self, host: &str, fragment: &str, stderr: &str) -> Self {
        self.host(host)
            .failures
            .push((fragment.to_string(), stderr.to_string()));
        self
    }

    /// Commands containing `fragment` take `delay` to finish
    pub fn delay_command(mut self, host: &str, fragment: &str, delay: Duration) -> Self {
        self.host(host).delays.push((fragment.to_string(), delay));
        self
    }

    /// Every command run against `host`, in order
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any command containing `fragment` ran against `host`
    pub fn ran(&self, host: &str, fragment: &str) -> bool {
        self.commands_for(host).iter().any(|c| c.contains(fragment))
    }

    fn host(&mut self, host: &str) -> &mut HostRules {
        self.rules.entry(host.to_string()).or_default()
    }

    fn record(&self, host: &str, command: &str) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .entry(host.to_string())
            .or_default()
            .push(command.to_string());
    }

    async fn wait_for(&self, rules: Option<&HostRules>, command: &str) {
        let extra = rules
            .and_then(|r| r.delays.iter().find(|(fragment, _)| command.contains(fragment.as_str())))
            .map(|(_, delay)| *delay)
            .unwrap_or_default();
        let total = self.latency + extra;
        if !total.is_zero() {
            tokio::time::sleep(total).await;
        }
    }

    fn reachability(rules: Option<&HostRules>, target: &ServerTarget) -> Result<(), FleetError> {
        match rules.and_then(|r| r.unreachable.as_ref()) {
            Some(reason) => Err(FleetError::ConnectionError(format!(
                "{}: {}",
                target.address(),
                reason
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedExecutor {
    async fn check_connection(&self, target: &ServerTarget) -> Result<bool, FleetError> {
        let rules = self.rules.get(&target.host);
        self.record(&target.host, "true");
        self.wait_for(rules, "true").await;

        Self::reachability(rules, target)?;
        Ok(!rules.is_some_and(|r| r.auth_denied))
    }

    async fn exec(
        &self,
        target: &ServerTarget,
        command: &str,
    ) -> Result<CommandOutput, FleetError> {
        let rules = self.rules.get(&target.host);
        self.record(&target.host, command);
        debug!("Simulating remote command on {}", target.address());
        self.wait_for(rules, command).await;

        Self::reachability(rules, target)?;
        if rules.is_some_and(|r| r.auth_denied) {
            return Err(FleetError::ConnectionError(format!(
                "{}: Permission denied (publickey)",
                target.address()
            )));
        }

        if let Some((_, stderr)) = rules.and_then(|r| {
            r.failures
                .iter()
                .find(|(fragment, _)| command.contains(fragment.as_str()))
        }) {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("{}\n", stderr),
                exit_code: 1,
            });
        }

        let stdout = if command.contains("node --version") {
            let version = rules
                .and_then(|r| r.node_version.as_deref())
                .unwrap_or(DEFAULT_NODE_VERSION);
            format!("{}\n", version)
        } else {
            String::new()
        };

        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}
