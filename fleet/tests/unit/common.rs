//! Shared fixtures

use std::path::PathBuf;
use std::sync::Arc;

use fleetd::app::state::AppState;
use fleetd::deploy::plan::DeployPlan;
use fleetd::deploy::CoordinatorOptions;
use fleetd::models::progress::{BatchEvent, DeploymentProgress};
use fleetd::models::target::{NewTarget, ServerTarget};
use fleetd::registry::{ServerRegistry, StatusUpdate};
use fleetd::storage::settings::DeploySettings;
use fleetd::transport::RemoteExecutor;

pub fn new_target(name: &str, host: &str) -> NewTarget {
    NewTarget {
        name: name.to_string(),
        host: host.to_string(),
        username: "ubuntu".to_string(),
        key_locator: "~/.ssh/id_ed25519".to_string(),
    }
}

pub fn plan() -> Arc<DeployPlan> {
    Arc::new(DeployPlan::with_payload(
        &DeploySettings::default(),
        serde_json::json!({"gateway": {"port": 3000}}),
    ))
}

/// Application state over an in-memory registry
pub fn app(executor: Arc<dyn RemoteExecutor>) -> AppState {
    app_with(executor, CoordinatorOptions::default())
}

pub fn app_with(executor: Arc<dyn RemoteExecutor>, options: CoordinatorOptions) -> AppState {
    AppState::new(
        Arc::new(ServerRegistry::in_memory()),
        executor,
        plan(),
        options,
    )
}

/// Register one target per host (named after the host) and mark it connected
pub async fn connected(registry: &ServerRegistry, hosts: &[&str]) -> Vec<ServerTarget> {
    let mut targets = Vec::new();
    for host in hosts {
        let target = registry.add(new_target(host, host)).await.unwrap();
        let target = registry
            .apply(StatusUpdate::ConnectionTested {
                target_id: target.id.clone(),
                success: true,
            })
            .await
            .unwrap()
            .unwrap();
        targets.push(target);
    }
    targets
}

pub fn ids(targets: &[ServerTarget]) -> Vec<String> {
    targets.iter().map(|t| t.id.clone()).collect()
}

/// Progress events of one target, in arrival order
pub fn progress_for<'a>(events: &'a [BatchEvent], target_id: &str) -> Vec<&'a DeploymentProgress> {
    events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Progress(p) if p.target_id == target_id => Some(p),
            _ => None,
        })
        .collect()
}

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fleetd-test-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
