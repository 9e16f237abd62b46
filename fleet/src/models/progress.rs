//! Deployment progress models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stage. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Connect,
    Node,
    AgentInstall,
    Config,
    Daemon,
    Complete,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 6] = [
        Stage::Connect,
        Stage::Node,
        Stage::AgentInstall,
        Stage::Config,
        Stage::Daemon,
        Stage::Complete,
    ];

    /// Position in the pipeline, starting at zero
    pub fn index(self) -> usize {
        match self {
            Stage::Connect => 0,
            Stage::Node => 1,
            Stage::AgentInstall => 2,
            Stage::Config => 3,
            Stage::Daemon => 4,
            Stage::Complete => 5,
        }
    }

    /// The stage after this one, `None` for `Complete`
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn first() -> Stage {
        Stage::Connect
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Node => "node",
            Stage::AgentInstall => "agent-install",
            Stage::Config => "config",
            Stage::Daemon => "daemon",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

/// One progress event for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentProgress {
    pub target_id: String,
    pub target_name: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
}

impl DeploymentProgress {
    /// True when this event ends the target's pipeline for the batch
    pub fn is_terminal(&self) -> bool {
        self.status == StageStatus::Failed
            || (self.stage == Stage::Complete && self.status == StageStatus::Completed)
    }
}

/// Current state of one target within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProgress {
    pub target_id: String,
    pub target_name: String,
    pub stage: Option<Stage>,
    pub status: StageStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stopped at a stage boundary by a batch cancel
    #[serde(default)]
    pub cancelled: bool,
    /// The feed closed before a terminal event was observed
    #[serde(default)]
    pub unresolved: bool,
}

/// Aggregate view of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub deployed_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    pub total: usize,
    pub in_progress: bool,
    pub transport_lost: bool,
}

/// Event published on a batch feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BatchEvent {
    /// Stage progress for one target
    Progress(DeploymentProgress),

    /// A target stopped at a stage boundary after a cancel request
    TargetCancelled {
        target_id: String,
        last_completed: Option<Stage>,
    },

    /// The feed for these targets closed before their terminal event
    TransportLost {
        target_ids: Vec<String>,
        message: String,
    },

    /// Last event of every batch feed
    BatchFinished {
        batch_id: String,
        summary: BatchSummary,
    },
}

/// Request body for starting a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub server_ids: Vec<String>,
}
