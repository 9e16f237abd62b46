//! Finite state machine for one target's deployment pipeline

use std::time::Duration;

use crate::models::progress::{Stage, StageStatus};

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upper bound for a single stage
    pub stage_timeout: Duration,

    /// Buffered events per worker before the worker waits on the coordinator
    pub worker_channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(600),
            worker_channel_capacity: 64,
        }
    }
}

/// Pipeline state: the current stage and its status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineState {
    pub stage: Stage,
    pub status: StageStatus,
}

/// Pipeline event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Enter the next stage (or the first one)
    Start,

    /// Informational progress within the running stage
    Report,

    /// The running stage completed
    Succeed,

    /// The running stage failed
    Fail(String),
}

/// Pipeline FSM
///
/// `connect → node → agent-install → config → daemon → complete`, with
/// `failed` reachable from every running stage. A stage is entered only
/// after the previous one completed, and a failed pipeline accepts no
/// further events.
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    error: Option<String>,
    last_completed: Option<Stage>,
}

impl PipelineFsm {
    /// Create a new FSM positioned before the first stage
    pub fn new() -> Self {
        Self {
            state: PipelineState {
                stage: Stage::first(),
                status: StageStatus::Pending,
            },
            error: None,
            last_completed: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Last stage that reported `completed`
    pub fn last_completed(&self) -> Option<Stage> {
        self.last_completed
    }

    /// Pipeline finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        self.state.status == StageStatus::Failed
            || (self.state.stage == Stage::Complete && self.state.status == StageStatus::Completed)
    }

    /// The stage that `Start` would enter, if any
    pub fn next_stage(&self) -> Option<Stage> {
        match self.state.status {
            StageStatus::Pending => Some(self.state.stage),
            StageStatus::Completed => self.state.stage.next(),
            StageStatus::Running | StageStatus::Failed => None,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<PipelineState, String> {
        let PipelineState { stage, status } = self.state;

        let new_state = match (status, &event) {
            (StageStatus::Pending, PipelineEvent::Start) => PipelineState {
                stage,
                status: StageStatus::Running,
            },
            (StageStatus::Completed, PipelineEvent::Start) => match stage.next() {
                Some(next) => PipelineState {
                    stage: next,
                    status: StageStatus::Running,
                },
                None => return Err(format!("Pipeline already complete at {}", stage)),
            },

            (StageStatus::Running, PipelineEvent::Report) => self.state,
            (StageStatus::Running, PipelineEvent::Succeed) => {
                self.last_completed = Some(stage);
                PipelineState {
                    stage,
                    status: StageStatus::Completed,
                }
            }
            (StageStatus::Running, PipelineEvent::Fail(err)) => {
                self.error = Some(err.clone());
                PipelineState {
                    stage,
                    status: StageStatus::Failed,
                }
            }

            (status, event) => {
                return Err(format!(
                    "Invalid transition: {} ({:?}) -> {:?}",
                    stage, status, event
                ));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}
