//! Batch deployment integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use fleetd::deploy::{CoordinatorOptions, ProgressView};
use fleetd::errors::FleetError;
use fleetd::models::progress::{BatchEvent, Stage, StageStatus};
use fleetd::models::target::{ServerTarget, TargetStatus};
use fleetd::transport::simulated::SimulatedExecutor;
use fleetd::transport::{CommandOutput, RemoteExecutor};

use crate::common::{app, app_with, connected, ids, new_target, progress_for};

fn assert_non_decreasing(events: &[BatchEvent], target_id: &str) {
    let stages: Vec<Stage> = progress_for(events, target_id)
        .iter()
        .map(|p| p.stage)
        .collect();
    for pair in stages.windows(2) {
        assert!(pair[0] <= pair[1], "{target_id} regressed: {stages:?}");
    }
}

fn final_summary(events: &[BatchEvent]) -> fleetd::models::progress::BatchSummary {
    match events.last() {
        Some(BatchEvent::BatchFinished { summary, .. }) => summary.clone(),
        other => panic!("feed did not end with batch-finished: {other:?}"),
    }
}

#[tokio::test]
async fn test_one_failure_leaves_siblings_deployed() {
    let executor = SimulatedExecutor::new().fail_command("b", "npm install -g", "disk full");
    let app = app(Arc::new(executor));
    let targets = connected(&app.registry, &["a", "b", "c"]).await;
    let (a, b, c) = (&targets[0], &targets[1], &targets[2]);

    let handle = app.coordinator.start_batch(ids(&targets)).await.unwrap();
    let events = handle.feed.collect().await.unwrap();

    for target in &targets {
        assert_non_decreasing(&events, &target.id);
    }

    // B halts at agent-install
    let b_events = progress_for(&events, &b.id);
    let last = b_events.last().unwrap();
    assert_eq!(last.stage, Stage::AgentInstall);
    assert_eq!(last.status, StageStatus::Failed);
    assert_eq!(last.message, "disk full");
    assert!(b_events.iter().all(|p| p.stage <= Stage::AgentInstall));

    // in_progress flips only once all three are terminal
    let mut view = ProgressView::new(targets.iter().map(|t| (t.id.clone(), t.name.clone())));
    let mut terminal_seen = 0;
    for event in &events {
        if let BatchEvent::Progress(p) = event {
            assert!(view.in_progress());
            view.apply(p);
            if p.is_terminal() {
                terminal_seen += 1;
            }
            assert_eq!(view.in_progress(), terminal_seen < 3);
        }
    }

    let summary = final_summary(&events);
    assert_eq!(summary.deployed_count, 2);
    assert_eq!(summary.failed_count, 1);
    assert_eq!(summary.total, 3);
    assert!(!summary.in_progress);
    assert!(!summary.transport_lost);

    let status = |t: &ServerTarget| {
        let registry = app.registry.clone();
        let id = t.id.clone();
        async move { registry.get(&id).await.unwrap() }
    };
    assert_eq!(status(a).await.status, TargetStatus::Deployed);
    assert_eq!(status(c).await.status, TargetStatus::Deployed);
    let b_now = status(b).await;
    assert_eq!(b_now.status, TargetStatus::Failed);
    assert_eq!(b_now.reached_stage(), Some(Stage::AgentInstall));

    let snapshot = app.coordinator.snapshot(&handle.batch_id).await.unwrap();
    assert_eq!(snapshot.summary, summary);
    let b_progress = snapshot.targets.iter().find(|t| t.target_id == b.id).unwrap();
    assert_eq!(b_progress.stage, Some(Stage::AgentInstall));
    assert_eq!(b_progress.message, "disk full");
}

#[tokio::test]
async fn test_sequences_are_independent() {
    let executor = SimulatedExecutor::new()
        .fail_command("a", "npm install -g", "disk full")
        .delay_command("slow", "npm install -g", Duration::from_millis(300));
    let app = app(Arc::new(executor));
    let targets = connected(&app.registry, &["a", "b", "slow"]).await;
    let (a, b, slow) = (&targets[0], &targets[1], &targets[2]);

    let events = app
        .coordinator
        .start_batch(ids(&targets))
        .await
        .unwrap()
        .feed
        .collect()
        .await
        .unwrap();

    // A's failure never shows up in B's sequence
    let b_events = progress_for(&events, &b.id);
    assert!(b_events.iter().all(|p| p.target_id == b.id));
    assert!(b_events.iter().all(|p| p.status != StageStatus::Failed));
    assert!(b_events.iter().all(|p| !p.message.contains("disk full")));
    let completed: Vec<Stage> = b_events
        .iter()
        .filter(|p| p.status == StageStatus::Completed)
        .map(|p| p.stage)
        .collect();
    assert_eq!(completed, Stage::ALL.to_vec());

    // A slow target does not hold back a fast one
    let position = |id: &str, stage: Stage| {
        events
            .iter()
            .position(|e| {
                matches!(e, BatchEvent::Progress(p)
                    if p.target_id == id && p.stage == stage && p.status.is_terminal())
            })
            .unwrap()
    };
    assert!(position(&b.id, Stage::Complete) < position(&slow.id, Stage::AgentInstall));
    assert_eq!(
        progress_for(&events, &a.id).last().unwrap().status,
        StageStatus::Failed
    );
}

#[tokio::test]
async fn test_preconditions_checked_before_start() {
    let executor = Arc::new(SimulatedExecutor::new());
    let app = app(executor.clone());
    let targets = connected(&app.registry, &["a"]).await;
    let pending = app.registry.add(new_target("p", "p.example")).await.unwrap();

    let err = app.coordinator.start_batch(vec![]).await.err().unwrap();
    assert!(matches!(err, FleetError::InvalidState(_)));

    let err = app
        .coordinator
        .start_batch(vec![targets[0].id.clone(), "srv-missing".to_string()])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetError::NotFound(_)));

    let err = app
        .coordinator
        .start_batch(vec![targets[0].id.clone(), pending.id.clone()])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetError::InvalidState(_)));

    // Nothing ran for the rejected batches
    assert!(executor.commands_for("a").is_empty());
    assert!(!app.coordinator.is_target_busy(&targets[0].id));

    // Duplicates collapse to one worker
    let handle = app
        .coordinator
        .start_batch(vec![targets[0].id.clone(), targets[0].id.clone()])
        .await
        .unwrap();
    let events = handle.feed.collect().await.unwrap();
    assert_eq!(final_summary(&events).total, 1);
    assert_eq!(
        executor
            .commands_for("a")
            .iter()
            .filter(|c| c.contains("npm install -g"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_overlapping_batch_is_rejected() {
    let executor = SimulatedExecutor::new().delay_command("a", "npm install -g", Duration::from_millis(200));
    let app = app(Arc::new(executor));
    let targets = connected(&app.registry, &["a", "b"]).await;

    let first = app
        .coordinator
        .start_batch(vec![targets[0].id.clone()])
        .await
        .unwrap();
    assert!(app.coordinator.is_target_busy(&targets[0].id));

    let err = app
        .coordinator
        .start_batch(vec![targets[1].id.clone(), targets[0].id.clone()])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetError::Conflict(_)));
    assert!(!app.coordinator.is_target_busy(&targets[1].id));

    let err = app.rollback.rollback(&targets[0].id).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    let snapshot = app.coordinator.wait(&first.batch_id).await.unwrap();
    assert_eq!(snapshot.summary.deployed_count, 1);
    assert!(!app.coordinator.is_in_progress(&first.batch_id).await.unwrap());
    assert!(!app.coordinator.is_target_busy(&targets[0].id));
}

#[tokio::test]
async fn test_cancel_stops_at_stage_boundary() {
    let executor = Arc::new(
        SimulatedExecutor::new()
            .delay_command("a", "npm install -g", Duration::from_millis(300))
            .delay_command("b", "npm install -g", Duration::from_millis(300)),
    );
    let app = app(executor.clone());
    let targets = connected(&app.registry, &["a", "b"]).await;

    let mut handle = app.coordinator.start_batch(ids(&targets)).await.unwrap();
    let mut events = Vec::new();
    let mut cancelled = false;
    while let Some(event) = handle.feed.next().await.unwrap() {
        if !cancelled {
            if let BatchEvent::Progress(p) = &event {
                if p.stage == Stage::AgentInstall && p.status == StageStatus::Running {
                    app.coordinator.cancel_batch(&handle.batch_id).await.unwrap();
                    cancelled = true;
                }
            }
        }
        events.push(event);
    }

    let summary = final_summary(&events);
    assert_eq!(summary.cancelled_count, 2);
    assert_eq!(summary.deployed_count, 0);
    assert!(!summary.in_progress);

    // The running stage was allowed to finish
    let last_completed: Vec<Option<Stage>> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::TargetCancelled { last_completed, .. } => Some(*last_completed),
            _ => None,
        })
        .collect();
    assert_eq!(last_completed.len(), 2);
    assert!(last_completed.contains(&Some(Stage::AgentInstall)));

    for target in &targets {
        assert!(!executor.ran(&target.host, "install-daemon"));
        assert_eq!(
            app.registry.get(&target.id).await.unwrap().status,
            TargetStatus::Connected
        );
    }

    // Cancelling a finished batch is a no-op
    assert!(app.coordinator.cancel_batch(&handle.batch_id).await.is_ok());
    let err = app.coordinator.cancel_batch("batch-missing").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
}

/// Records the highest number of hosts with a command in flight
#[derive(Default)]
struct CountingExecutor {
    inner: SimulatedExecutor,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingExecutor {
    async fn track<T>(&self, call: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RemoteExecutor for CountingExecutor {
    async fn check_connection(&self, target: &ServerTarget) -> Result<bool, FleetError> {
        self.track(self.inner.check_connection(target)).await
    }

    async fn exec(&self, target: &ServerTarget, command: &str) -> Result<CommandOutput, FleetError> {
        self.track(self.inner.exec(target, command)).await
    }
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let executor = Arc::new(CountingExecutor::default());
    let options = CoordinatorOptions {
        max_parallel: 2,
        ..CoordinatorOptions::default()
    };
    let app = app_with(executor.clone(), options);
    let targets = connected(&app.registry, &["a", "b", "c", "d", "e"]).await;

    let events = app
        .coordinator
        .start_batch(ids(&targets))
        .await
        .unwrap()
        .feed
        .collect()
        .await
        .unwrap();

    assert_eq!(final_summary(&events).deployed_count, 5);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
}

/// Dies in the middle of agent-install on one host
struct CrashingExecutor {
    inner: SimulatedExecutor,
    crash_host: String,
}

#[async_trait]
impl RemoteExecutor for CrashingExecutor {
    async fn check_connection(&self, target: &ServerTarget) -> Result<bool, FleetError> {
        self.inner.check_connection(target).await
    }

    async fn exec(&self, target: &ServerTarget, command: &str) -> Result<CommandOutput, FleetError> {
        self.inner.exec(target, command).await
    }

    async fn exec_streaming(
        &self,
        target: &ServerTarget,
        command: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<CommandOutput, FleetError> {
        if target.host == self.crash_host && command.contains("npm install -g") {
            panic!("transport to {} crashed", target.host);
        }
        self.inner.exec_streaming(target, command, lines).await
    }
}

#[tokio::test]
async fn test_lost_feed_leaves_target_unresolved() {
    let executor = CrashingExecutor {
        inner: SimulatedExecutor::new(),
        crash_host: "b".to_string(),
    };
    let app = app(Arc::new(executor));
    let targets = connected(&app.registry, &["a", "b"]).await;
    let (a, b) = (&targets[0], &targets[1]);

    let events = app
        .coordinator
        .start_batch(ids(&targets))
        .await
        .unwrap()
        .feed
        .collect()
        .await
        .unwrap();

    let lost: Vec<&Vec<String>> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::TransportLost { target_ids, .. } => Some(target_ids),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![&vec![b.id.clone()]]);

    let summary = final_summary(&events);
    assert!(summary.transport_lost);
    assert!(!summary.in_progress);
    assert_eq!(summary.deployed_count, 1);
    assert_eq!(summary.failed_count, 0);

    // A completed, B is neither deployed nor failed
    assert_eq!(
        app.registry.get(&a.id).await.unwrap().status,
        TargetStatus::Deployed
    );
    let b_now = app.registry.get(&b.id).await.unwrap();
    assert_eq!(b_now.status, TargetStatus::Connected);

    let b_progress = app
        .coordinator
        .wait(&events_batch_id(&events))
        .await
        .unwrap()
        .targets
        .into_iter()
        .find(|t| t.target_id == b.id)
        .unwrap();
    assert!(b_progress.unresolved);
    assert_eq!(b_progress.stage, Some(Stage::AgentInstall));
    assert_eq!(b_progress.status, StageStatus::Running);
    assert!(!app.coordinator.is_target_busy(&b.id));
}

fn events_batch_id(events: &[BatchEvent]) -> String {
    match events.last() {
        Some(BatchEvent::BatchFinished { batch_id, .. }) => batch_id.clone(),
        _ => panic!("no batch-finished event"),
    }
}

#[tokio::test]
async fn test_lagging_subscriber_gets_transport_error() {
    let executor = SimulatedExecutor::new();
    let options = CoordinatorOptions {
        feed_capacity: 2,
        ..CoordinatorOptions::default()
    };
    let app = app_with(Arc::new(executor), options);
    let targets = connected(&app.registry, &["a", "b", "c"]).await;

    let mut handle = app.coordinator.start_batch(ids(&targets)).await.unwrap();
    app.coordinator.wait(&handle.batch_id).await.unwrap();

    let err = handle.feed.next().await.unwrap_err();
    assert!(matches!(err, FleetError::TransportError(_)));

    // Resumes from the oldest retained event and still sees the end
    let rest = handle.feed.collect().await.unwrap();
    assert!(matches!(rest.last(), Some(BatchEvent::BatchFinished { .. })));
}

#[tokio::test]
async fn test_connection_test_cannot_overwrite_batch_result() {
    let executor = SimulatedExecutor::new().delay_command("a", "true", Duration::from_millis(200));
    let app = app(Arc::new(executor));
    let targets = connected(&app.registry, &["a"]).await;
    let a = &targets[0];

    let handle = app.coordinator.start_batch(ids(&targets)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = app.test_server(&a.id).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    let events = handle.feed.collect().await.unwrap();
    assert_eq!(final_summary(&events).deployed_count, 1);
    assert_eq!(
        app.registry.get(&a.id).await.unwrap().status,
        TargetStatus::Deployed
    );
}

#[tokio::test]
async fn test_batch_waits_for_running_connection_test() {
    let executor = SimulatedExecutor::new().delay_command("a", "true", Duration::from_millis(200));
    let app = Arc::new(app(Arc::new(executor)));
    let targets = connected(&app.registry, &["a"]).await;
    let id = targets[0].id.clone();

    let testing = {
        let app = app.clone();
        let id = id.clone();
        tokio::spawn(async move { app.test_server(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = app.coordinator.start_batch(vec![id.clone()]).await.err().unwrap();
    assert!(matches!(err, FleetError::Conflict(_)));
    let err = app.rollback.rollback(&id).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    assert!(testing.await.unwrap().unwrap().success);
    let handle = app.coordinator.start_batch(vec![id.clone()]).await.unwrap();
    let snapshot = app.coordinator.wait(&handle.batch_id).await.unwrap();
    assert_eq!(snapshot.summary.deployed_count, 1);
}

#[tokio::test]
async fn test_only_finished_batches_are_evicted() {
    let executor = SimulatedExecutor::new().delay_command("a", "npm install -g", Duration::from_millis(300));
    let options = CoordinatorOptions {
        retained_batches: 1,
        ..CoordinatorOptions::default()
    };
    let app = app_with(Arc::new(executor), options);
    let targets = connected(&app.registry, &["a", "b"]).await;
    let (a, b) = (&targets[0], &targets[1]);

    let slow = app.coordinator.start_batch(vec![a.id.clone()]).await.unwrap();
    let fast = app.coordinator.start_batch(vec![b.id.clone()]).await.unwrap();
    app.coordinator.wait(&fast.batch_id).await.unwrap();

    app.test_server(&b.id).await.unwrap();
    let next = app.coordinator.start_batch(vec![b.id.clone()]).await.unwrap();

    // The finished batch goes, the running one stays over the limit
    let err = app.coordinator.snapshot(&fast.batch_id).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
    assert!(app.coordinator.snapshot(&slow.batch_id).await.is_ok());

    app.coordinator.wait(&slow.batch_id).await.unwrap();
    app.coordinator.wait(&next.batch_id).await.unwrap();
    app.test_server(&b.id).await.unwrap();
    let last = app.coordinator.start_batch(vec![b.id.clone()]).await.unwrap();

    assert!(app.coordinator.snapshot(&slow.batch_id).await.is_err());
    assert!(app.coordinator.snapshot(&next.batch_id).await.is_err());
    assert!(app.coordinator.snapshot(&last.batch_id).await.is_ok());
}
