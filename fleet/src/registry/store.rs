//! Server registry store
//!
//! The registry is the single owner of every target's status. Status is
//! changed only through [`StatusUpdate`] messages produced by connection
//! tests, deployment workers and rollbacks. Writers hold the write lock
//! across persistence, so concurrent mutations are serialized and never
//! interleave on disk.

use std::collections::BTreeSet;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::models::progress::Stage;
use crate::models::target::{NewTarget, ServerTarget, TargetStatus};
use crate::registry::validate::validate_new_target;
use crate::utils::generate_server_id;

/// A result message that may change a target's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Outcome of a connection test
    ConnectionTested { target_id: String, success: bool },

    /// A deployment entered `stage` on this target
    StageReached { target_id: String, stage: Stage },

    /// Terminal result of a deployment worker
    DeployFinished { target_id: String, success: bool },

    /// A rollback pass finished. `remaining` holds the stages whose
    /// compensation failed and must be retried.
    RolledBack {
        target_id: String,
        remaining: BTreeSet<Stage>,
    },
}

impl StatusUpdate {
    pub fn target_id(&self) -> &str {
        match self {
            StatusUpdate::ConnectionTested { target_id, .. }
            | StatusUpdate::StageReached { target_id, .. }
            | StatusUpdate::DeployFinished { target_id, .. }
            | StatusUpdate::RolledBack { target_id, .. } => target_id,
        }
    }
}

/// Registry of server targets, kept in insertion order
pub struct ServerRegistry {
    targets: RwLock<Vec<ServerTarget>>,
    file: Option<File>,
}

impl ServerRegistry {
    /// Open a registry persisted to `file`, loading existing entries
    pub async fn open(file: File) -> Result<Self, FleetError> {
        let targets: Vec<ServerTarget> = file.read_json_or_default().await?;
        info!(
            "Loaded {} server target(s) from {}",
            targets.len(),
            file.path().display()
        );
        Ok(Self {
            targets: RwLock::new(targets),
            file: Some(file),
        })
    }

    /// A registry that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            file: None,
        }
    }

    /// Validate and store a new target, assigning it an id
    pub async fn add(&self, new_target: NewTarget) -> Result<ServerTarget, FleetError> {
        validate_new_target(&new_target)?;

        let target = ServerTarget {
            id: generate_server_id(),
            name: new_target.name.trim().to_string(),
            host: new_target.host,
            username: new_target.username,
            key_locator: new_target.key_locator,
            status: TargetStatus::Pending,
            reached_stages: Default::default(),
        };

        let mut targets = self.targets.write().await;
        let mut next = targets.clone();
        next.push(target.clone());
        self.persist(&next).await?;
        *targets = next;

        info!("Added server: {} ({})", target.name, target.id);
        Ok(target)
    }

    /// All targets in insertion order
    pub async fn list(&self) -> Vec<ServerTarget> {
        self.targets.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ServerTarget> {
        self.targets.read().await.iter().find(|t| t.id == id).cloned()
    }

    /// Remove a target. Returns `false` if the id was unknown, which is not
    /// an error.
    pub async fn remove(&self, id: &str) -> Result<bool, FleetError> {
        let mut targets = self.targets.write().await;
        if !targets.iter().any(|t| t.id == id) {
            debug!("Remove of unknown server {} ignored", id);
            return Ok(false);
        }

        let next: Vec<ServerTarget> = targets.iter().filter(|t| t.id != id).cloned().collect();
        self.persist(&next).await?;
        *targets = next;

        info!("Removed server: {}", id);
        Ok(true)
    }

    /// Apply a result message. Returns the updated target, or `None` if the
    /// target has been removed in the meantime.
    pub async fn apply(&self, update: StatusUpdate) -> Result<Option<ServerTarget>, FleetError> {
        let mut targets = self.targets.write().await;
        let Some(index) = targets.iter().position(|t| t.id == update.target_id()) else {
            debug!("Status update for unknown server ignored: {:?}", update);
            return Ok(None);
        };

        let mut target = targets[index].clone();
        match &update {
            StatusUpdate::ConnectionTested { success, .. } => {
                target.status = if *success {
                    TargetStatus::Connected
                } else {
                    TargetStatus::Failed
                };
            }
            StatusUpdate::StageReached { stage, .. } => {
                // Entering a stage implies every earlier stage ran
                target
                    .reached_stages
                    .extend(Stage::ALL.into_iter().filter(|s| s <= stage));
            }
            StatusUpdate::DeployFinished { success, .. } => {
                target.status = if *success {
                    TargetStatus::Deployed
                } else {
                    TargetStatus::Failed
                };
            }
            StatusUpdate::RolledBack { remaining, .. } => {
                target.status = TargetStatus::Pending;
                target.reached_stages = remaining.clone();
            }
        }

        if target == targets[index] {
            return Ok(Some(target));
        }

        let mut next = targets.clone();
        next[index] = target.clone();
        self.persist(&next).await?;
        *targets = next;

        debug!(
            "Server {} is now {} (reached {:?})",
            target.id,
            target.status,
            target.reached_stage()
        );
        Ok(Some(target))
    }

    async fn persist(&self, targets: &[ServerTarget]) -> Result<(), FleetError> {
        match &self.file {
            Some(file) => file.write_json(&targets).await,
            None => Ok(()),
        }
    }
}
