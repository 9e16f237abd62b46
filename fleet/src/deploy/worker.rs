//! Per-target deployment worker
//!
//! A worker drives one target through the pipeline for one batch. It shares
//! no state with other workers; everything it does is visible only through
//! the messages it sends on its own channel.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{PipelineEvent, PipelineFsm, PipelineSettings};
use crate::deploy::plan::DeployPlan;
use crate::errors::FleetError;
use crate::models::progress::{DeploymentProgress, Stage};
use crate::models::target::ServerTarget;
use crate::transport::{CommandOutput, RemoteExecutor};
use crate::utils::unix_now;

/// Message from a worker to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Progress(DeploymentProgress),

    /// Stopped at a stage boundary because the batch was cancelled
    Cancelled {
        target_id: String,
        last_completed: Option<Stage>,
    },
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Deployed,
    Failed { stage: Stage, error: String },
    Cancelled { last_completed: Option<Stage> },
}

/// Deployment worker for one target
pub struct DeploymentWorker {
    target: ServerTarget,
    executor: Arc<dyn RemoteExecutor>,
    plan: Arc<DeployPlan>,
    settings: PipelineSettings,
    events: mpsc::Sender<WorkerMessage>,
    cancel: watch::Receiver<bool>,
    fsm: PipelineFsm,
    feed_closed: bool,
}

impl DeploymentWorker {
    pub fn new(
        target: ServerTarget,
        executor: Arc<dyn RemoteExecutor>,
        plan: Arc<DeployPlan>,
        settings: PipelineSettings,
        events: mpsc::Sender<WorkerMessage>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            target,
            executor,
            plan,
            settings,
            events,
            cancel,
            fsm: PipelineFsm::new(),
            feed_closed: false,
        }
    }

    /// Run the pipeline to completion, failure or cancellation
    pub async fn run(mut self) -> WorkerOutcome {
        info!("Deploying to {} ({})", self.target.address(), self.target.id);

        while let Some(stage) = self.fsm.next_stage() {
            if *self.cancel.borrow() {
                let last_completed = self.fsm.last_completed();
                info!(
                    "Deployment to {} cancelled before {} stage",
                    self.target.address(),
                    stage
                );
                self.send(WorkerMessage::Cancelled {
                    target_id: self.target.id.clone(),
                    last_completed,
                })
                .await;
                return WorkerOutcome::Cancelled { last_completed };
            }

            let intro = self.stage_intro(stage);
            self.emit(PipelineEvent::Start, intro, None).await;

            let result = match tokio::time::timeout(
                self.settings.stage_timeout,
                self.run_stage(stage),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FleetError::stage(
                    stage,
                    format!("timed out after {}s", self.settings.stage_timeout.as_secs()),
                )),
            };

            match result {
                Ok(message) => {
                    self.emit(PipelineEvent::Succeed, message, None).await;
                }
                Err(e) => {
                    let summary = e.summary();
                    warn!(
                        "Deployment to {} failed at {}: {}",
                        self.target.address(),
                        stage,
                        e
                    );
                    self.emit(
                        PipelineEvent::Fail(summary.clone()),
                        summary,
                        Some(e.to_string()),
                    )
                    .await;
                    return WorkerOutcome::Failed {
                        stage,
                        error: e.to_string(),
                    };
                }
            }
        }

        info!("Deployment to {} complete", self.target.address());
        WorkerOutcome::Deployed
    }

    fn stage_intro(&self, stage: Stage) -> String {
        match stage {
            Stage::Connect => format!("Connecting to {}...", self.target.address()),
            Stage::Node => "Checking Node.js installation...".to_string(),
            Stage::AgentInstall => format!("Installing {} via npm...", self.plan.package),
            Stage::Config => "Writing configuration...".to_string(),
            Stage::Daemon => "Installing daemon...".to_string(),
            Stage::Complete => "Finalizing deployment...".to_string(),
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<String, FleetError> {
        match stage {
            Stage::Connect => self.connect().await,
            Stage::Node => self.ensure_node().await,
            Stage::AgentInstall => {
                let command = self.plan.agent_install_command();
                self.stream(stage, command).await?;
                Ok(format!("{} installed successfully", self.plan.package))
            }
            Stage::Config => {
                let command = self.plan.write_config_command()?;
                self.exec(stage, &command).await?;
                Ok(format!(
                    "Configuration written to ~/{}/{}",
                    self.plan.remote_config_dir, self.plan.remote_config_file
                ))
            }
            Stage::Daemon => {
                let command = self.plan.daemon_install_command();
                self.exec(stage, &command).await?;
                self.emit(
                    PipelineEvent::Report,
                    "Daemon installed, starting...".to_string(),
                    None,
                )
                .await;

                let command = self.plan.daemon_start_command();
                self.exec(stage, &command).await?;
                Ok("Daemon started successfully".to_string())
            }
            Stage::Complete => Ok("Deployment complete".to_string()),
        }
    }

    async fn connect(&mut self) -> Result<String, FleetError> {
        match self.executor.check_connection(&self.target).await? {
            true => Ok(format!("Connected to {}", self.target.address())),
            false => Err(FleetError::ConnectionError(
                "SSH authentication failed. Check your SSH key and username.".to_string(),
            )),
        }
    }

    async fn ensure_node(&mut self) -> Result<String, FleetError> {
        let check = self
            .executor
            .exec(&self.target, &self.plan.node_version_command())
            .await;

        if let Ok(output) = &check {
            if output.success() {
                let version = output.stdout.trim().to_string();
                match DeployPlan::parse_node_major(&version) {
                    Some(major) if major >= self.plan.min_node_major => {
                        return Ok(format!("Node.js {} already installed", version));
                    }
                    Some(major) => debug!(
                        "Node.js {} on {} is older than {}, upgrading",
                        major,
                        self.target.address(),
                        self.plan.min_node_major
                    ),
                    None => debug!("Could not parse Node.js version: {}", version),
                }
            }
        }

        self.emit(
            PipelineEvent::Report,
            "Installing Node.js via nvm...".to_string(),
            None,
        )
        .await;

        let command = self.plan.node_install_command();
        let output = self.stream(Stage::Node, command).await?;
        let version = output.stdout.lines().last().unwrap_or_default().trim();
        Ok(format!("Node.js {} installed successfully", version))
    }

    /// Run a command, failing the stage on a non-zero exit
    async fn exec(&self, stage: Stage, command: &str) -> Result<CommandOutput, FleetError> {
        let output = self
            .executor
            .exec(&self.target, command)
            .await
            .map_err(|e| FleetError::stage(stage, e.summary()))?;
        Self::require_success(stage, output)
    }

    /// Run a command, forwarding each output line as a progress report
    async fn stream(&mut self, stage: Stage, command: String) -> Result<CommandOutput, FleetError> {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(100);

        let executor = self.executor.clone();
        let target = self.target.clone();
        let exec = async move { executor.exec_streaming(&target, &command, line_tx).await };

        let forward = async {
            while let Some(line) = line_rx.recv().await {
                self.emit(PipelineEvent::Report, line, None).await;
            }
        };

        let (result, ()) = tokio::join!(exec, forward);
        let output = result.map_err(|e| FleetError::stage(stage, e.summary()))?;
        Self::require_success(stage, output)
    }

    fn require_success(stage: Stage, output: CommandOutput) -> Result<CommandOutput, FleetError> {
        if output.success() {
            Ok(output)
        } else {
            Err(FleetError::stage(stage, output.failure_reason()))
        }
    }

    async fn emit(&mut self, event: PipelineEvent, message: String, error: Option<String>) {
        let state = match self.fsm.process(event) {
            Ok(state) => state,
            Err(e) => {
                error!("Pipeline for {} rejected event: {}", self.target.id, e);
                return;
            }
        };

        let progress = DeploymentProgress {
            target_id: self.target.id.clone(),
            target_name: self.target.name.clone(),
            stage: state.stage,
            status: state.status,
            message,
            error,
            timestamp: unix_now(),
        };
        self.send(WorkerMessage::Progress(progress)).await;
    }

    async fn send(&mut self, message: WorkerMessage) {
        if self.events.send(message).await.is_err() && !self.feed_closed {
            self.feed_closed = true;
            warn!(
                "Progress receiver for {} dropped, updates are no longer delivered",
                self.target.id
            );
        }
    }
}
