//! Server target models

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::progress::Stage;

/// Status of a server target. Owned by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Pending,
    Connected,
    Failed,
    Deployed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Connected => "connected",
            TargetStatus::Failed => "failed",
            TargetStatus::Deployed => "deployed",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote host under management
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    /// Registry-assigned id
    pub id: String,

    /// Display name
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// Remote login name
    pub username: String,

    /// Reference to the credential material (e.g. a private key path)
    pub key_locator: String,

    /// Current status
    #[serde(default)]
    pub status: TargetStatus,

    /// Pipeline stages entered by deployments whose effects have not been
    /// compensated yet
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub reached_stages: BTreeSet<Stage>,
}

impl ServerTarget {
    /// Highest stage in [`reached_stages`](Self::reached_stages)
    pub fn reached_stage(&self) -> Option<Stage> {
        self.reached_stages.last().copied()
    }

    /// `user@host`, the only form in which a target is logged
    pub fn address(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Input for registering a new target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTarget {
    pub name: String,
    pub host: String,
    pub username: String,
    pub key_locator: String,
}

/// Result of testing a server connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTestResult {
    pub server_id: String,
    pub success: bool,
    pub message: String,
}
