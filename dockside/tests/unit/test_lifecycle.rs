//! Container lifecycle tests

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use dockside::deploy::lifecycle::{RunOptions, MAX_PORT_RACE_RETRIES};
use dockside::engine::{EngineError, LogSink};
use dockside::errors::OrchestratorError;
use dockside::models::resource::{RunStatus, Upstream};
use dockside::registry::Registry;

use crate::support::{harness, log_line, resource, SERVER_ID};

fn remove_existing() -> RunOptions {
    RunOptions {
        remove_existing: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_creates_one_container_per_instance() {
    let web = resource("r1", "web", 3);
    let h = harness(vec![web.clone()]);

    h.lifecycle.run(&web, RunOptions::default()).await.unwrap();

    assert_eq!(
        h.engine.names(),
        vec![
            "web-r1-container-0",
            "web-r1-container-1",
            "web-r1-container-2"
        ]
    );
    for name in h.engine.names() {
        let c = h.engine.container(&name).unwrap();
        assert!(c.running);
        assert_eq!(c.image, "web-r1");
    }

    let stored = h.registry.resource("r1").await.unwrap();
    let detail = stored.server_detail(SERVER_ID).unwrap();
    assert_eq!(detail.run_status, RunStatus::Running);
    assert_eq!(
        detail.upstreams,
        vec![
            Upstream::new("10.0.0.1", 4000),
            Upstream::new("10.0.0.1", 4001),
            Upstream::new("10.0.0.1", 4002)
        ]
    );
}

#[tokio::test]
async fn test_scaling_down_removes_extra_instances() {
    let mut web = resource("r1", "web", 3);
    let h = harness(vec![web.clone()]);
    h.lifecycle.run(&web, remove_existing()).await.unwrap();

    web.instances_per_server = 1;
    h.lifecycle.run(&web, remove_existing()).await.unwrap();

    assert_eq!(h.engine.names(), vec!["web-r1-container-0"]);
    let stored = h.registry.resource("r1").await.unwrap();
    assert_eq!(stored.server_detail(SERVER_ID).unwrap().upstreams.len(), 1);
}

#[tokio::test]
async fn test_reconcile_ignores_foreign_containers() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.insert("web-r1-container-5", 5000, true);
    h.engine.insert("web-r1-container-x", 5001, true);
    h.engine.insert("api-r2-container-3", 5002, true);

    let removed = h.lifecycle.reconcile(&web, 1).await;

    assert_eq!(removed, vec!["web-r1-container-5".to_string()]);
    assert_eq!(
        h.engine.names(),
        vec!["api-r2-container-3", "web-r1-container-x"]
    );
}

#[tokio::test]
async fn test_run_twice_with_remove_existing_keeps_one_container() {
    let web = resource("r1", "web", 2);
    let h = harness(vec![web.clone()]);

    h.lifecycle.run(&web, remove_existing()).await.unwrap();
    h.lifecycle.run(&web, remove_existing()).await.unwrap();

    assert_eq!(
        h.engine.names(),
        vec!["web-r1-container-0", "web-r1-container-1"]
    );
    // the second run got fresh ports
    assert_eq!(h.engine.container("web-r1-container-0").unwrap().host_port, 4002);
    assert_eq!(h.engine.container("web-r1-container-1").unwrap().host_port, 4003);
}

#[tokio::test]
async fn test_port_race_retries_with_new_port() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.fail_starts(
        EngineError::PortAllocated("Bind for 0.0.0.0:4000 failed: port is already allocated".into()),
        3,
    );

    h.lifecycle.run(&web, RunOptions::default()).await.unwrap();

    let c = h.engine.container("web-r1-container-0").unwrap();
    assert!(c.running);
    assert_eq!(c.host_port, 4003);
    let stored = h.registry.resource("r1").await.unwrap();
    assert_eq!(
        stored.server_detail(SERVER_ID).unwrap().upstreams,
        vec![Upstream::new("10.0.0.1", 4003)]
    );
}

#[tokio::test]
async fn test_port_race_gives_up_after_max_retries() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.fail_starts(
        EngineError::PortAllocated("port is already allocated".into()),
        (MAX_PORT_RACE_RETRIES + 1) as usize,
    );

    let err = h.lifecycle.run(&web, RunOptions::default()).await.unwrap_err();

    match err {
        OrchestratorError::PortRace { container, attempts } => {
            assert_eq!(container, "web-r1-container-0");
            assert_eq!(attempts, MAX_PORT_RACE_RETRIES + 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    // a failed run records nothing
    let stored = h.registry.resource("r1").await.unwrap();
    assert!(stored.server_detail(SERVER_ID).is_none());
}

#[tokio::test]
async fn test_address_in_use_is_reported_with_port() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.fail_starts(
        EngineError::AddressInUse("bind: address already in use".into()),
        1,
    );

    let err = h.lifecycle.run(&web, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PortInUse(4000)));
}

#[tokio::test]
async fn test_missing_image_is_resource_not_found() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.missing_image.store(true, Ordering::SeqCst);

    let err = h.lifecycle.run(&web, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceNotFound(id) if id == "r1"));
}

#[tokio::test]
async fn test_existing_container_is_adopted_without_remove() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.insert("web-r1-container-0", 5000, false);

    h.lifecycle.run(&web, RunOptions::default()).await.unwrap();

    let c = h.engine.container("web-r1-container-0").unwrap();
    assert!(c.running);
    assert_eq!(c.image, "existing");
    let stored = h.registry.resource("r1").await.unwrap();
    assert_eq!(
        stored.server_detail(SERVER_ID).unwrap().upstreams,
        vec![Upstream::new("10.0.0.1", 5000)]
    );
}

#[tokio::test]
async fn test_ignore_if_running_leaves_instance_alone() {
    let web = resource("r1", "web", 2);
    let h = harness(vec![web.clone()]);
    h.engine.insert("web-r1-container-0", 5000, true);

    let opts = RunOptions {
        ignore_if_running: true,
        ..Default::default()
    };
    h.lifecycle.run(&web, opts).await.unwrap();

    assert_eq!(h.engine.container("web-r1-container-0").unwrap().host_port, 5000);
    assert_eq!(h.engine.container("web-r1-container-1").unwrap().host_port, 4000);
    let stored = h.registry.resource("r1").await.unwrap();
    assert_eq!(
        stored.server_detail(SERVER_ID).unwrap().upstreams,
        vec![Upstream::new("10.0.0.1", 5000), Upstream::new("10.0.0.1", 4000)]
    );
}

#[tokio::test]
async fn test_stop_and_run_status() {
    let web = resource("r1", "web", 2);
    let h = harness(vec![web.clone()]);
    assert_eq!(h.lifecycle.run_status(&web).await, RunStatus::NotRunning);

    h.lifecycle.run(&web, RunOptions::default()).await.unwrap();
    assert_eq!(h.lifecycle.run_status(&web).await, RunStatus::Running);

    // one running instance is enough
    h.engine.set_running("web-r1-container-0", false);
    assert_eq!(h.lifecycle.run_status(&web).await, RunStatus::Running);

    h.lifecycle.stop(&web).await.unwrap();
    assert_eq!(h.lifecycle.run_status(&web).await, RunStatus::NotRunning);
    let stored = h.registry.resource("r1").await.unwrap();
    let detail = stored.server_detail(SERVER_ID).unwrap();
    assert_eq!(detail.run_status, RunStatus::NotRunning);
    assert!(detail.upstreams.is_empty());
}

#[tokio::test]
async fn test_stop_fails_on_missing_container() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);

    let err = h.lifecycle.stop(&web).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Engine(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_run_attaches_stdout() {
    let web = resource("r1", "web", 1);
    let h = harness(vec![web.clone()]);
    h.engine.script_logs(
        "web-r1-container-0",
        vec![vec![
            log_line("web-r1-container-0", 1, "listening"),
            log_line("web-r1-container-0", 2, "ready"),
        ]],
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn LogSink> = Arc::new(tx);
    let opts = RunOptions {
        stdout: Some(sink),
        ..Default::default()
    };
    h.lifecycle.run(&web, opts).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().message, "listening");
    assert_eq!(rx.recv().await.unwrap().message, "ready");
}

#[tokio::test]
async fn test_stream_logs_follows_every_instance() {
    let web = resource("r1", "web", 2);
    let h = harness(vec![web.clone()]);
    h.lifecycle.run(&web, RunOptions::default()).await.unwrap();
    h.engine
        .script_logs("web-r1-container-0", vec![vec![log_line("web-r1-container-0", 1, "a")]]);
    h.engine
        .script_logs("web-r1-container-1", vec![vec![log_line("web-r1-container-1", 2, "b")]]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    h.lifecycle
        .stream_logs(&web, &HashMap::new(), Arc::new(tx), Default::default())
        .await;

    let mut messages = vec![rx.recv().await.unwrap().message, rx.recv().await.unwrap().message];
    messages.sort();
    assert_eq!(messages, vec!["a", "b"]);
}
