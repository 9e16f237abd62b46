//! Read model of a batch, built by folding its event stream

use std::collections::HashMap;

use tracing::debug;

use crate::models::progress::{
    BatchEvent, BatchSummary, DeploymentProgress, Stage, StageStatus, TargetProgress,
};

/// Per-target and aggregate state of one batch.
///
/// Events are keyed by target id, so interleaving across targets does not
/// matter. An event that would move a target backwards, or that arrives
/// after the target reached a terminal status, is ignored.
#[derive(Debug, Clone)]
pub struct ProgressView {
    order: Vec<String>,
    targets: HashMap<String, TargetProgress>,
    transport_lost: bool,
}

impl ProgressView {
    /// Create a view for `(id, name)` pairs, in submission order
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut order = Vec::new();
        let mut map = HashMap::new();
        for (id, name) in targets {
            let id = id.into();
            if map.contains_key(&id) {
                continue;
            }
            map.insert(
                id.clone(),
                TargetProgress {
                    target_id: id.clone(),
                    target_name: name.into(),
                    stage: None,
                    status: StageStatus::Pending,
                    message: "Waiting to start".to_string(),
                    error: None,
                    cancelled: false,
                    unresolved: false,
                },
            );
            order.push(id);
        }

        Self {
            order,
            targets: map,
            transport_lost: false,
        }
    }

    /// Fold one progress event. Returns whether it was accepted.
    pub fn apply(&mut self, event: &DeploymentProgress) -> bool {
        let Some(current) = self.targets.get_mut(&event.target_id) else {
            debug!("Ignoring progress for unknown target {}", event.target_id);
            return false;
        };

        if Self::target_is_terminal(current) {
            debug!(
                "Ignoring progress for {} after terminal status",
                event.target_id
            );
            return false;
        }

        if let Some(recorded) = current.stage {
            let regresses = event.stage < recorded
                || (event.stage == recorded
                    && current.status == StageStatus::Completed
                    && event.status != StageStatus::Completed);
            if regresses {
                debug!(
                    "Ignoring regressing progress for {}: {} after {}",
                    event.target_id, event.stage, recorded
                );
                return false;
            }
        }

        current.stage = Some(event.stage);
        current.status = event.status;
        current.message = event.message.clone();
        current.error = event.error.clone();
        true
    }

    /// Fold any batch event. Returns whether the view changed.
    pub fn apply_event(&mut self, event: &BatchEvent) -> bool {
        match event {
            BatchEvent::Progress(progress) => self.apply(progress),
            BatchEvent::TargetCancelled {
                target_id,
                last_completed,
            } => self.mark_cancelled(target_id, *last_completed),
            BatchEvent::TransportLost { .. } => !self.mark_transport_lost().is_empty(),
            BatchEvent::BatchFinished { .. } => false,
        }
    }

    /// Record that a target stopped at a stage boundary
    pub fn mark_cancelled(&mut self, target_id: &str, last_completed: Option<Stage>) -> bool {
        let Some(current) = self.targets.get_mut(target_id) else {
            return false;
        };
        if Self::target_is_terminal(current) {
            return false;
        }

        current.cancelled = true;
        current.message = match last_completed {
            Some(stage) => format!("Cancelled after {} stage", stage),
            None => "Cancelled before start".to_string(),
        };
        true
    }

    /// The feed closed. Every target without a terminal status is marked
    /// unresolved and the batch stops being in progress. Returns those ids.
    pub fn mark_transport_lost(&mut self) -> Vec<String> {
        let unresolved = self.unresolved();
        for id in &unresolved {
            if let Some(current) = self.targets.get_mut(id) {
                current.unresolved = true;
            }
        }
        self.transport_lost = true;
        unresolved
    }

    /// Targets that have not reached a terminal status, in submission order
    pub fn unresolved(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.targets
                    .get(*id)
                    .is_some_and(|t| !Self::target_is_terminal(t))
            })
            .cloned()
            .collect()
    }

    pub fn target(&self, target_id: &str) -> Option<&TargetProgress> {
        self.targets.get(target_id)
    }

    /// All targets in submission order
    pub fn targets(&self) -> Vec<TargetProgress> {
        self.order
            .iter()
            .filter_map(|id| self.targets.get(id))
            .cloned()
            .collect()
    }

    pub fn is_terminal(&self, target_id: &str) -> bool {
        self.targets
            .get(target_id)
            .is_some_and(Self::target_is_terminal)
    }

    pub fn in_progress(&self) -> bool {
        !self.transport_lost && !self.unresolved().is_empty()
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            deployed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            total: self.order.len(),
            in_progress: self.in_progress(),
            transport_lost: self.transport_lost,
        };

        for target in self.targets.values() {
            if target.cancelled {
                summary.cancelled_count += 1;
            } else if target.status == StageStatus::Failed {
                summary.failed_count += 1;
            } else if target.stage == Some(Stage::Complete)
                && target.status == StageStatus::Completed
            {
                summary.deployed_count += 1;
            }
        }

        summary
    }

    fn target_is_terminal(target: &TargetProgress) -> bool {
        target.cancelled
            || target.status == StageStatus::Failed
            || (target.stage == Some(Stage::Complete) && target.status == StageStatus::Completed)
    }
}
