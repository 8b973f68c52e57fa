//! Build FSM tests

use dockside::deploy::fsm::{BuildEvent, BuildFsm, BuildStep};
use dockside::models::deployment::DeploymentStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = BuildFsm::new();
    assert_eq!(fsm.step(), BuildStep::Connect);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.status(), DeploymentStatus::Running);
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = BuildFsm::new();

    for expected in [
        BuildStep::Clone,
        BuildStep::Build,
        BuildStep::Run,
        BuildStep::Succeeded,
    ] {
        assert_eq!(fsm.process(BuildEvent::StepDone).unwrap(), expected);
    }
    assert_eq!(fsm.status(), DeploymentStatus::Succeeded);
}

#[test]
fn test_fsm_failure_keeps_message() {
    let mut fsm = BuildFsm::new();
    fsm.process(BuildEvent::StepDone).unwrap();
    fsm.process(BuildEvent::Fail("git exited with 128".to_string()))
        .unwrap();

    assert_eq!(fsm.step(), BuildStep::Failed);
    assert_eq!(fsm.error(), Some("git exited with 128"));
    assert_eq!(fsm.status(), DeploymentStatus::Failed);
}

#[test]
fn test_fsm_terminal_steps_reject_events() {
    let mut fsm = BuildFsm::new();
    fsm.process(BuildEvent::Fail("boom".to_string())).unwrap();

    assert!(fsm.process(BuildEvent::StepDone).is_err());
    assert!(fsm.process(BuildEvent::Fail("again".to_string())).is_err());
    assert_eq!(fsm.error(), Some("boom"));
}

#[test]
fn test_step_names() {
    assert_eq!(BuildStep::Connect.as_str(), "connect");
    assert_eq!(BuildStep::Run.as_str(), "run");
    assert!(BuildStep::Succeeded.is_terminal());
    assert!(!BuildStep::Build.is_terminal());
}
