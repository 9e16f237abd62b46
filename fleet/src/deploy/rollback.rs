//! Rollback of a partial or failed deployment
//!
//! Compensating actions run in reverse pipeline order. Only actions whose
//! forward stage the target reached and that have not been undone yet are
//! attempted; the rest are reported as skipped. A failing action does not
//! stop the pass and is the only one retried by the next rollback.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::coordinator::ActiveTargets;
use crate::deploy::plan::DeployPlan;
use crate::errors::FleetError;
use crate::models::progress::Stage;
use crate::models::rollback::{RollbackResult, RollbackStage, RollbackStatus};
use crate::models::target::ServerTarget;
use crate::registry::{ServerRegistry, StatusUpdate};
use crate::transport::RemoteExecutor;

/// A compensating action and the forward stage it undoes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    StopDaemon,
    RemoveConfig,
    UninstallAgent,
}

impl Compensation {
    /// Execution order
    pub const ALL: [Compensation; 3] = [
        Compensation::StopDaemon,
        Compensation::RemoveConfig,
        Compensation::UninstallAgent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Compensation::StopDaemon => "stop_daemon",
            Compensation::RemoveConfig => "remove_config",
            Compensation::UninstallAgent => "uninstall_agent",
        }
    }

    pub fn undoes(self) -> Stage {
        match self {
            Compensation::StopDaemon => Stage::Daemon,
            Compensation::RemoveConfig => Stage::Config,
            Compensation::UninstallAgent => Stage::AgentInstall,
        }
    }

    fn command(self, plan: &DeployPlan) -> String {
        match self {
            Compensation::StopDaemon => plan.stop_daemon_command(),
            Compensation::RemoveConfig => plan.remove_config_command(),
            Compensation::UninstallAgent => plan.uninstall_command(),
        }
    }
}

/// Drives best-effort compensation for one target at a time
pub struct RollbackController {
    registry: Arc<ServerRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    plan: Arc<DeployPlan>,
    active: Arc<ActiveTargets>,
}

impl RollbackController {
    pub fn new(
        registry: Arc<ServerRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        plan: Arc<DeployPlan>,
        active: Arc<ActiveTargets>,
    ) -> Self {
        Self {
            registry,
            executor,
            plan,
            active,
        }
    }

    /// Roll back `target_id` and reset it to `pending`.
    ///
    /// Rejected with `Conflict` while a batch or another rollback is driving
    /// the target. Running it again on a rolled-back target skips every
    /// action.
    pub async fn rollback(&self, target_id: &str) -> Result<RollbackResult, FleetError> {
        // Read the target only while holding it, so a batch finishing in
        // between cannot change what needs undoing
        let _guard = self.active.claim(&[target_id.to_string()]).map_err(|_| {
            FleetError::Conflict(format!(
                "server {} is being deployed or rolled back",
                target_id
            ))
        })?;

        let target = self
            .registry
            .get(target_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("server {}", target_id)))?;

        info!(
            "Rolling back {} (reached {})",
            target.address(),
            target
                .reached_stage()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "nothing".to_string())
        );

        let mut stages = Vec::with_capacity(Compensation::ALL.len());
        let mut remaining = BTreeSet::new();
        for compensation in Compensation::ALL {
            let stage = self.compensate(&target, compensation).await;
            if stage.status == RollbackStatus::Failed {
                remaining.insert(compensation.undoes());
            }
            stages.push(stage);
        }

        self.registry
            .apply(StatusUpdate::RolledBack {
                target_id: target.id.clone(),
                remaining,
            })
            .await?;

        let failed: Vec<&str> = stages
            .iter()
            .filter(|s| s.status == RollbackStatus::Failed)
            .map(|s| s.name.as_str())
            .collect();
        let error = if failed.is_empty() {
            info!("Rollback of {} complete", target.address());
            None
        } else {
            warn!(
                "Rollback of {} finished with failures: {}",
                target.address(),
                failed.join(", ")
            );
            Some(format!("Rollback failed for stages: {}", failed.join(", ")))
        };

        Ok(RollbackResult {
            server_id: target.id,
            success: error.is_none(),
            stages,
            error,
        })
    }

    async fn compensate(&self, target: &ServerTarget, compensation: Compensation) -> RollbackStage {
        let mut stage = RollbackStage::pending(compensation.name());

        if !target.reached_stages.contains(&compensation.undoes()) {
            stage.status = RollbackStatus::Skipped;
            stage.message = Some(format!(
                "nothing to undo for the {} stage",
                compensation.undoes()
            ));
            return stage;
        }

        stage.status = RollbackStatus::Running;
        let command = compensation.command(&self.plan);
        let outcome = match self.executor.exec(target, &command).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.failure_reason()),
            Err(e) => Err(e.summary()),
        };

        match outcome {
            Ok(()) => {
                stage.status = RollbackStatus::Success;
            }
            Err(message) => {
                let err = FleetError::RollbackError {
                    stage: compensation.name().to_string(),
                    message,
                };
                warn!("{} on {}", err, target.address());
                stage.status = RollbackStatus::Failed;
                stage.message = Some(err.to_string());
            }
        }
        stage
    }
}
