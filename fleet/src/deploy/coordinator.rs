//! Deployment coordinator
//!
//! Starts one [`DeploymentWorker`] per target of a batch, fans their
//! per-worker channels into one feed and keeps the registry and the batch's
//! [`ProgressView`] current.
//!
//! Each worker owns an mpsc channel. The channels are merged with
//! `select_all`, so events of one target stay in order while targets
//! interleave freely. A single pump task per batch consumes the merged
//! stream, applies status updates, then republishes every event on a
//! broadcast feed for subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{select_all, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::PipelineSettings;
use crate::deploy::plan::DeployPlan;
use crate::deploy::progress::ProgressView;
use crate::deploy::worker::{DeploymentWorker, WorkerMessage};
use crate::errors::FleetError;
use crate::models::progress::{
    BatchEvent, BatchSummary, DeploymentProgress, Stage, StageStatus, TargetProgress,
};
use crate::models::target::{ServerTarget, TargetStatus};
use crate::registry::{ServerRegistry, StatusUpdate};
use crate::storage::settings::DeploySettings;
use crate::transport::RemoteExecutor;
use crate::utils::generate_batch_id;

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Maximum number of workers running at once across a batch
    pub max_parallel: usize,

    /// Events buffered on a batch feed before slow subscribers lag
    pub feed_capacity: usize,

    /// Batches kept for snapshots. Finished batches beyond this are
    /// evicted oldest first; running batches are never evicted.
    pub retained_batches: usize,

    pub pipeline: PipelineSettings,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            feed_capacity: 1024,
            retained_batches: 64,
            pipeline: PipelineSettings::default(),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_settings(settings: &DeploySettings) -> Self {
        Self {
            max_parallel: settings.max_parallel.max(1),
            feed_capacity: settings.feed_capacity.max(16),
            retained_batches: CoordinatorOptions::default().retained_batches,
            pipeline: PipelineSettings {
                stage_timeout: Duration::from_secs(settings.stage_timeout_secs),
                ..PipelineSettings::default()
            },
        }
    }
}

// ===== Busy targets =====

/// Targets with an in-flight batch or rollback.
///
/// Shared by the coordinator and the rollback controller so that a target
/// is never driven by two operations at once.
#[derive(Debug, Default)]
pub struct ActiveTargets {
    ids: Mutex<HashSet<String>>,
}

impl ActiveTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every id or none of them. On conflict returns the busy ids.
    pub fn claim(self: &Arc<Self>, ids: &[String]) -> Result<ActiveGuard, Vec<String>> {
        let mut active = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let busy: Vec<String> = ids.iter().filter(|id| active.contains(*id)).cloned().collect();
        if !busy.is_empty() {
            return Err(busy);
        }

        active.extend(ids.iter().cloned());
        Ok(ActiveGuard {
            owner: Arc::clone(self),
            ids: ids.to_vec(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    fn release(&self, ids: &[String]) {
        let mut active = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            active.remove(id);
        }
    }
}

/// Releases its targets when dropped
#[derive(Debug)]
pub struct ActiveGuard {
    owner: Arc<ActiveTargets>,
    ids: Vec<String>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.owner.release(&self.ids);
    }
}

// ===== Batch state =====

/// Point-in-time view of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub targets: Vec<TargetProgress>,
    pub summary: BatchSummary,
}

struct BatchState {
    batch_id: String,
    target_ids: Vec<String>,
    view: RwLock<ProgressView>,
    cancel: watch::Sender<bool>,
    feed: broadcast::Sender<BatchEvent>,
    finished: watch::Sender<bool>,
}

impl BatchState {
    async fn snapshot(&self) -> BatchSnapshot {
        let view = self.view.read().await;
        BatchSnapshot {
            batch_id: self.batch_id.clone(),
            targets: view.targets(),
            summary: view.summary(),
        }
    }

    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    fn publish(&self, event: BatchEvent) {
        // No subscribers is fine, the view still has the state
        let _ = self.feed.send(event);
    }
}

/// Subscriber side of a batch feed
pub struct BatchFeed {
    rx: broadcast::Receiver<BatchEvent>,
    done: bool,
}

impl BatchFeed {
    /// Next event, or `None` once the batch has finished.
    ///
    /// A subscriber that falls more than the feed capacity behind gets a
    /// `TransportError`; later calls resume from the oldest retained event.
    pub async fn next(&mut self) -> Result<Option<BatchEvent>, FleetError> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv().await {
            Ok(event) => {
                if matches!(event, BatchEvent::BatchFinished { .. }) {
                    self.done = true;
                }
                Ok(Some(event))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.done = true;
                Ok(None)
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(FleetError::TransportError(
                format!("feed subscriber fell behind and missed {} event(s)", missed),
            )),
        }
    }

    /// Drain the feed until the batch finishes, collecting every event
    pub async fn collect(mut self) -> Result<Vec<BatchEvent>, FleetError> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Returned by [`DeploymentCoordinator::start_batch`]
pub struct BatchHandle {
    pub batch_id: String,

    /// Subscribed before any worker started, so no event is missed
    pub feed: BatchFeed,
}

// ===== Coordinator =====

/// Runs batches of deployments
pub struct DeploymentCoordinator {
    registry: Arc<ServerRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    plan: Arc<DeployPlan>,
    options: CoordinatorOptions,
    active: Arc<ActiveTargets>,
    batches: Arc<RwLock<Vec<Arc<BatchState>>>>,
}

impl DeploymentCoordinator {
    pub fn new(
        registry: Arc<ServerRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        plan: Arc<DeployPlan>,
        active: Arc<ActiveTargets>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            registry,
            executor,
            plan,
            options,
            active,
            batches: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Start deploying to `target_ids`.
    ///
    /// None of the ids may be part of an in-flight batch, rollback or
    /// connection test, and every id must exist and be `connected`. Nothing
    /// is started unless all checks pass. Duplicate ids are collapsed.
    pub async fn start_batch(&self, target_ids: Vec<String>) -> Result<BatchHandle, FleetError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = target_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        if ids.is_empty() {
            return Err(FleetError::InvalidState(
                "a batch needs at least one server".to_string(),
            ));
        }

        // Validate only while holding the targets, so a rollback or test
        // cannot change their status between the check and the spawn
        let guard = self.active.claim(&ids).map_err(|busy| {
            FleetError::Conflict(format!(
                "server(s) already being deployed, tested or rolled back: {}",
                busy.join(", ")
            ))
        })?;

        let mut targets = Vec::with_capacity(ids.len());
        for id in &ids {
            let target = self
                .registry
                .get(id)
                .await
                .ok_or_else(|| FleetError::NotFound(format!("server {}", id)))?;
            if target.status != TargetStatus::Connected {
                return Err(FleetError::InvalidState(format!(
                    "server {} is {}, only connected servers can be deployed",
                    target.name, target.status
                )));
            }
            targets.push(target);
        }

        let batch_id = generate_batch_id();
        let (feed, rx) = broadcast::channel(self.options.feed_capacity);
        let (cancel, cancel_rx) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        let state = Arc::new(BatchState {
            batch_id: batch_id.clone(),
            target_ids: ids.clone(),
            view: RwLock::new(ProgressView::new(
                targets.iter().map(|t| (t.id.clone(), t.name.clone())),
            )),
            cancel,
            feed,
            finished,
        });
        self.retain(state.clone()).await;

        info!("Starting batch {} for {} server(s)", batch_id, ids.len());

        let pump = BatchPump {
            state,
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            plan: self.plan.clone(),
            options: self.options.clone(),
            cancel: cancel_rx,
            guard,
        };
        tokio::spawn(pump.run(targets));

        Ok(BatchHandle {
            batch_id,
            feed: BatchFeed { rx, done: false },
        })
    }

    /// Ask every worker of a batch to stop at its next stage boundary.
    /// Cancelling a finished batch is a no-op.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<(), FleetError> {
        let state = self.find(batch_id).await?;
        if state.is_finished() {
            debug!("Cancel of finished batch {} ignored", batch_id);
            return Ok(());
        }

        info!("Cancelling batch {}", batch_id);
        state.cancel.send_replace(true);
        Ok(())
    }

    /// Cancel every unfinished batch
    pub async fn cancel_all(&self) {
        for state in self.batches.read().await.iter() {
            if !state.is_finished() {
                info!("Cancelling batch {}", state.batch_id);
                state.cancel.send_replace(true);
            }
        }
    }

    pub async fn snapshot(&self, batch_id: &str) -> Result<BatchSnapshot, FleetError> {
        Ok(self.find(batch_id).await?.snapshot().await)
    }

    /// Subscribe to a running batch. Events published before this call are
    /// not replayed; use [`snapshot`](Self::snapshot) for the current state.
    pub async fn subscribe(&self, batch_id: &str) -> Result<BatchFeed, FleetError> {
        let state = self.find(batch_id).await?;
        Ok(BatchFeed {
            rx: state.feed.subscribe(),
            done: state.is_finished(),
        })
    }

    /// Wait until the batch has published its final event
    pub async fn wait(&self, batch_id: &str) -> Result<BatchSnapshot, FleetError> {
        let state = self.find(batch_id).await?;
        let mut finished = state.finished.subscribe();
        finished
            .wait_for(|done| *done)
            .await
            .map_err(|_| FleetError::Internal(format!("batch {} was dropped", batch_id)))?;
        Ok(state.snapshot().await)
    }

    /// True while the batch has targets without a terminal status
    pub async fn is_in_progress(&self, batch_id: &str) -> Result<bool, FleetError> {
        let state = self.find(batch_id).await?;
        let in_progress = state.view.read().await.in_progress();
        Ok(in_progress)
    }

    /// Whether a batch or rollback is currently driving this target
    pub fn is_target_busy(&self, target_id: &str) -> bool {
        self.active.contains(target_id)
    }

    /// Ids of batches that have not finished yet
    pub async fn running_batches(&self) -> Vec<String> {
        self.batches
            .read()
            .await
            .iter()
            .filter(|s| !s.is_finished())
            .map(|s| s.batch_id.clone())
            .collect()
    }

    async fn find(&self, batch_id: &str) -> Result<Arc<BatchState>, FleetError> {
        self.batches
            .read()
            .await
            .iter()
            .find(|s| s.batch_id == batch_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("batch {}", batch_id)))
    }

    /// Keep `state` and evict the oldest finished batches over the limit.
    ///
    /// Each running batch holds at least one target exclusively, so running
    /// batches never outnumber the registered targets.
    async fn retain(&self, state: Arc<BatchState>) {
        let mut batches = self.batches.write().await;
        batches.push(state);

        let mut excess = batches
            .len()
            .saturating_sub(self.options.retained_batches.max(1));
        if excess == 0 {
            return;
        }

        batches.retain(|s| {
            if excess > 0 && s.is_finished() {
                debug!("Evicting finished batch {}", s.batch_id);
                excess -= 1;
                return false;
            }
            true
        });
        if excess > 0 {
            debug!(
                "Retaining {} batch(es) over the limit of {}, all still running",
                excess, self.options.retained_batches
            );
        }
    }
}

// ===== Pump =====

/// Drives one batch from spawn to the final event
struct BatchPump {
    state: Arc<BatchState>,
    registry: Arc<ServerRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    plan: Arc<DeployPlan>,
    options: CoordinatorOptions,
    cancel: watch::Receiver<bool>,
    guard: ActiveGuard,
}

impl BatchPump {
    async fn run(self, targets: Vec<ServerTarget>) {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel));
        let mut workers = JoinSet::new();
        let mut streams = Vec::with_capacity(targets.len());

        for target in targets {
            let (tx, rx) = mpsc::channel(self.options.pipeline.worker_channel_capacity);
            streams.push(ReceiverStream::new(rx));

            let address = target.address();
            let worker = DeploymentWorker::new(
                target,
                self.executor.clone(),
                self.plan.clone(),
                self.options.pipeline.clone(),
                tx,
                self.cancel.clone(),
            );
            let sem = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                debug!("Worker for {} acquired a slot", address);
                Some(worker.run().await)
            });
        }

        let mut merged = select_all(streams);
        let mut stages: HashMap<String, Stage> = HashMap::new();
        while let Some(message) = merged.next().await {
            match message {
                WorkerMessage::Progress(progress) => self.on_progress(progress, &mut stages).await,
                WorkerMessage::Cancelled {
                    target_id,
                    last_completed,
                } => {
                    self.state
                        .view
                        .write()
                        .await
                        .mark_cancelled(&target_id, last_completed);
                    self.state.publish(BatchEvent::TargetCancelled {
                        target_id,
                        last_completed,
                    });
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker in batch {} aborted: {}", self.state.batch_id, e);
            }
        }

        self.finish().await;
    }

    async fn on_progress(&self, progress: DeploymentProgress, stages: &mut HashMap<String, Stage>) {
        let accepted = self.state.view.write().await.apply(&progress);
        if !accepted {
            return;
        }

        if stages.get(&progress.target_id) != Some(&progress.stage) {
            stages.insert(progress.target_id.clone(), progress.stage);
            self.update_registry(StatusUpdate::StageReached {
                target_id: progress.target_id.clone(),
                stage: progress.stage,
            })
            .await;
        }

        if progress.is_terminal() {
            self.update_registry(StatusUpdate::DeployFinished {
                target_id: progress.target_id.clone(),
                success: progress.status == StageStatus::Completed,
            })
            .await;
        }

        self.state.publish(BatchEvent::Progress(progress));
    }

    async fn finish(self) {
        let unresolved = {
            let mut view = self.state.view.write().await;
            let unresolved = view.unresolved();
            if !unresolved.is_empty() {
                view.mark_transport_lost();
            }
            unresolved
        };

        if !unresolved.is_empty() {
            warn!(
                "Batch {} lost the progress feed of {} server(s): {}",
                self.state.batch_id,
                unresolved.len(),
                unresolved.join(", ")
            );
            self.state.publish(BatchEvent::TransportLost {
                target_ids: unresolved,
                message: "progress feed closed before a terminal status was reported".to_string(),
            });
        }

        // Subscribers may act on the final event right away
        drop(self.guard);
        debug!(
            "Released {} server(s) of batch {}",
            self.state.target_ids.len(),
            self.state.batch_id
        );

        let summary = self.state.view.read().await.summary();
        info!(
            "Batch {} finished: {}/{} deployed, {} failed, {} cancelled",
            self.state.batch_id,
            summary.deployed_count,
            summary.total,
            summary.failed_count,
            summary.cancelled_count
        );
        self.state.publish(BatchEvent::BatchFinished {
            batch_id: self.state.batch_id.clone(),
            summary,
        });
        self.state.finished.send_replace(true);
    }

    async fn update_registry(&self, update: StatusUpdate) {
        if let Err(e) = self.registry.apply(update).await {
            error!(
                "Failed to record status in batch {}: {}",
                self.state.batch_id, e
            );
        }
    }
}
