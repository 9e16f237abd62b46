//! Application state management

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::options::AppOptions;
use crate::deploy::plan::DeployPlan;
use crate::deploy::{
    ActiveGuard, ActiveTargets, ConnectionTester, CoordinatorOptions, DeploymentCoordinator,
    RollbackController,
};
use crate::errors::FleetError;
use crate::models::target::{ServerTestResult, TargetStatus};
use crate::registry::{ServerRegistry, StatusUpdate};
use crate::transport::simulated::SimulatedExecutor;
use crate::transport::ssh::SshExecutor;
use crate::transport::RemoteExecutor;

/// Main application state
pub struct AppState {
    /// Server targets and their status
    pub registry: Arc<ServerRegistry>,

    /// Reachability checks
    pub tester: ConnectionTester,

    /// Batch deployments
    pub coordinator: Arc<DeploymentCoordinator>,

    /// Per-target compensation
    pub rollback: Arc<RollbackController>,

    /// Targets held by a batch, rollback, test or removal
    active: Arc<ActiveTargets>,
}

impl AppState {
    /// Initialize application state from options
    pub async fn init(options: &AppOptions) -> Result<Self, FleetError> {
        info!("Initializing application state...");

        let registry = ServerRegistry::open(options.storage.layout.servers_file()).await?;

        let executor: Arc<dyn RemoteExecutor> = if options.dry_run {
            warn!("Dry run enabled, remote hosts are simulated");
            Arc::new(SimulatedExecutor::new())
        } else {
            Arc::new(SshExecutor::new(options.transport.clone()))
        };

        let plan = DeployPlan::from_settings(&options.deploy).await?;

        Ok(Self::new(
            Arc::new(registry),
            executor,
            Arc::new(plan),
            options.coordinator(),
        ))
    }

    /// Wire the components around an existing registry and transport
    pub fn new(
        registry: Arc<ServerRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        plan: Arc<DeployPlan>,
        coordinator_options: CoordinatorOptions,
    ) -> Self {
        let active = Arc::new(ActiveTargets::new());

        let coordinator = Arc::new(DeploymentCoordinator::new(
            registry.clone(),
            executor.clone(),
            plan.clone(),
            active.clone(),
            coordinator_options,
        ));
        let rollback = Arc::new(RollbackController::new(
            registry.clone(),
            executor.clone(),
            plan,
            active.clone(),
        ));

        Self {
            registry,
            tester: ConnectionTester::new(executor),
            coordinator,
            rollback,
            active,
        }
    }

    /// Test one server and record the result.
    ///
    /// Rejected with `Conflict` while a batch or rollback drives the server,
    /// so a stale result never overwrites theirs.
    pub async fn test_server(&self, id: &str) -> Result<ServerTestResult, FleetError> {
        let _guard = self.claim(id)?;
        let target = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("server {}", id)))?;

        let result = self.tester.test(&target).await;
        self.record_test(&result).await?;
        Ok(result)
    }

    /// Test every `pending` or `failed` server concurrently and record the
    /// results. Busy servers are skipped.
    pub async fn test_pending(&self) -> Result<Vec<ServerTestResult>, FleetError> {
        let mut guards = Vec::new();
        let mut targets = Vec::new();
        for listed in self.registry.list().await {
            if !is_testable(listed.status) {
                continue;
            }
            let Ok(guard) = self.claim(&listed.id) else {
                debug!("Skipping busy server {}", listed.id);
                continue;
            };
            // Status may have moved before the claim
            match self.registry.get(&listed.id).await {
                Some(target) if is_testable(target.status) => {
                    guards.push(guard);
                    targets.push(target);
                }
                _ => {}
            }
        }

        let results = self.tester.test_many(&targets).await;
        for result in &results {
            self.record_test(result).await?;
        }
        Ok(results)
    }

    /// Remove a server that no batch, rollback or test is driving.
    /// Returns `false` if the id was unknown.
    pub async fn remove_server(&self, id: &str) -> Result<bool, FleetError> {
        let _guard = self.claim(id)?;
        self.registry.remove(id).await
    }

    fn claim(&self, id: &str) -> Result<ActiveGuard, FleetError> {
        self.active.claim(&[id.to_string()]).map_err(|_| {
            FleetError::Conflict(format!(
                "server {} is being deployed, tested or rolled back",
                id
            ))
        })
    }

    async fn record_test(&self, result: &ServerTestResult) -> Result<(), FleetError> {
        self.registry
            .apply(StatusUpdate::ConnectionTested {
                target_id: result.server_id.clone(),
                success: result.success,
            })
            .await?;
        Ok(())
    }

    /// Stop in-flight batches at their next stage boundary and wait for them
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        info!("Shutting down application state...");

        self.coordinator.cancel_all().await;
        for batch_id in self.coordinator.running_batches().await {
            self.coordinator.wait(&batch_id).await?;
        }
        Ok(())
    }
}

fn is_testable(status: TargetStatus) -> bool {
    matches!(status, TargetStatus::Pending | TargetStatus::Failed)
}
