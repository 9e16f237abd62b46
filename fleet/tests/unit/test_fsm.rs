//! Pipeline FSM tests

use fleetd::deploy::fsm::{PipelineEvent, PipelineFsm};
use fleetd::models::progress::{Stage, StageStatus};

#[test]
fn test_fsm_initial_state() {
    let fsm = PipelineFsm::new();
    assert_eq!(fsm.state().stage, Stage::Connect);
    assert_eq!(fsm.state().status, StageStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(fsm.last_completed().is_none());
    assert!(!fsm.is_terminal());
}

#[test]
fn test_fsm_advances_only_after_completion() {
    let mut fsm = PipelineFsm::new();

    fsm.process(PipelineEvent::Start).unwrap();
    // Still running connect, next stage not available
    assert_eq!(fsm.next_stage(), None);
    assert!(fsm.process(PipelineEvent::Start).is_err());

    fsm.process(PipelineEvent::Succeed).unwrap();
    assert_eq!(fsm.next_stage(), Some(Stage::Node));
    let state = fsm.process(PipelineEvent::Start).unwrap();
    assert_eq!(state.stage, Stage::Node);
}

#[test]
fn test_fsm_reports_stay_in_stage() {
    let mut fsm = PipelineFsm::new();
    fsm.process(PipelineEvent::Start).unwrap();

    for _ in 0..3 {
        let state = fsm.process(PipelineEvent::Report).unwrap();
        assert_eq!(state.stage, Stage::Connect);
        assert_eq!(state.status, StageStatus::Running);
    }
}

#[test]
fn test_fsm_failure_is_permanent() {
    let mut fsm = PipelineFsm::new();

    for _ in 0..2 {
        fsm.process(PipelineEvent::Start).unwrap();
        fsm.process(PipelineEvent::Succeed).unwrap();
    }
    fsm.process(PipelineEvent::Start).unwrap();
    fsm.process(PipelineEvent::Fail("disk full".to_string()))
        .unwrap();

    assert_eq!(fsm.state().stage, Stage::AgentInstall);
    assert_eq!(fsm.state().status, StageStatus::Failed);
    assert_eq!(fsm.last_completed(), Some(Stage::Node));
    assert_eq!(fsm.next_stage(), None);

    for event in [
        PipelineEvent::Start,
        PipelineEvent::Report,
        PipelineEvent::Succeed,
        PipelineEvent::Fail("again".to_string()),
    ] {
        assert!(fsm.process(event).is_err());
    }
    assert_eq!(fsm.error(), Some("disk full"));
}

#[test]
fn test_fsm_cannot_complete_without_start() {
    let mut fsm = PipelineFsm::new();
    assert!(fsm.process(PipelineEvent::Succeed).is_err());
    assert!(fsm.process(PipelineEvent::Report).is_err());
    assert_eq!(fsm.state().status, StageStatus::Pending);
}
