//! Rollback models

use serde::{Deserialize, Serialize};

/// Status of one compensating stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Outcome of one compensating stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStage {
    pub name: String,
    pub status: RollbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RollbackStage {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: RollbackStatus::Pending,
            message: None,
        }
    }
}

/// Result of a rollback invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub server_id: String,
    pub success: bool,
    pub stages: Vec<RollbackStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RollbackResult {
    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == RollbackStatus::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }
}
