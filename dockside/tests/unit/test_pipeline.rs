//! Build pipeline tests

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dockside::bus::local::LocalBus;
use dockside::bus::topics::Topics;
use dockside::bus::{PubSub, Subscription};
use dockside::deploy::pipeline::{BuildContext, BuildPipeline, PipelineOptions, BUILD_LABEL};
use dockside::engine::EngineError;
use dockside::errors::OrchestratorError;
use dockside::kv::lock::DistributedLock;
use dockside::kv::memory::MemoryKv;
use dockside::kv::KvStore;
use dockside::models::deployment::{BuildLogLine, DeploymentStatus};
use dockside::models::resource::{BuildMeta, LocalBuildMeta, Resource};

use crate::support::{harness, resource, Harness};

struct Fixture {
    h: Harness,
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn PubSub>,
    pipeline: Arc<BuildPipeline>,
    _workspaces: tempfile::TempDir,
}

fn fixture(resource: &Resource, lock_timeout: Duration) -> Fixture {
    let h = harness(vec![resource.clone()]);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn PubSub> = Arc::new(LocalBus::new());
    let workspaces = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(BuildPipeline::new(
        h.lifecycle.clone(),
        kv.clone(),
        bus.clone(),
        PipelineOptions {
            namespace: "test".to_string(),
            lock_timeout,
            run_log_base_url: "http://ui.local".to_string(),
            workspaces_dir: workspaces.path().to_path_buf(),
        },
    ));
    Fixture {
        h,
        kv,
        bus,
        pipeline,
        _workspaces: workspaces,
    }
}

async fn drain_build_log(subscription: &mut Subscription) -> Vec<BuildLogLine> {
    let mut lines = Vec::new();
    while let Ok(Some(payload)) =
        tokio::time::timeout(Duration::from_millis(100), subscription.next()).await
    {
        lines.push(serde_json::from_slice(&payload).unwrap());
    }
    lines
}

#[tokio::test]
async fn test_deploy_builds_and_runs() {
    let web = resource("r1", "web", 1);
    let f = fixture(&web, Duration::from_secs(5));
    let mut build_log = f
        .bus
        .subscribe(&Topics::build_logs("test", "r1"))
        .await
        .unwrap();

    let ctx = BuildContext::new("r1", "b1");
    let deployment = f.pipeline.deploy(&web, &ctx).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Succeeded);
    assert!(deployment.finished_at.is_some());
    assert!(deployment.failed_step.is_none());
    assert_eq!(ctx.subscribe().borrow().status, DeploymentStatus::Succeeded);

    let builds = f.h.engine.builds.lock().unwrap().clone();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].build_id, "r1-b1");
    assert_eq!(builds[0].tags, vec!["web-r1:latest".to_string()]);
    assert_eq!(builds[0].labels.get(BUILD_LABEL).map(String::as_str), Some("b1"));
    assert!(f.h.engine.container("web-r1-container-0").unwrap().running);

    let lines = drain_build_log(&mut build_log).await;
    let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
    assert!(messages.contains(&"Container successfully started."));
    assert!(messages.contains(&"View run logs: http://ui.local/resource/run-log?id=r1"));
    assert!(messages.iter().any(|m| m.starts_with("Step 1/1")));
    assert!(lines.iter().all(|l| l.build_id == "b1"));

    // lock released
    let lock = DistributedLock::new(f.kv.clone(), "r1", Duration::from_millis(100));
    lock.lock().await.unwrap();
}

#[tokio::test]
async fn test_deploy_fails_when_lock_is_held() {
    let web = resource("r1", "web", 1);
    let f = fixture(&web, Duration::from_millis(100));
    let holder = DistributedLock::new(f.kv.clone(), "r1", Duration::from_secs(5));
    holder.lock().await.unwrap();

    let ctx = BuildContext::new("r1", "b2");
    let err = f.pipeline.deploy(&web, &ctx).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::LockTimeout(_)));
    let deployment = ctx.deployment();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error_message.is_some());
    assert!(f.h.engine.builds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_build_failure_reports_step_and_releases_lock() {
    let web = resource("r1", "web", 1);
    let f = fixture(&web, Duration::from_secs(5));
    *f.h.engine.build_failure.lock().unwrap() =
        Some(EngineError::Other("The command '/bin/sh -c make' returned 2".to_string()));

    let ctx = BuildContext::new("r1", "b3");
    let err = f.pipeline.deploy(&web, &ctx).await.unwrap_err();

    match err {
        OrchestratorError::Build {
            resource_id, step, ..
        } => {
            assert_eq!(resource_id, "r1");
            assert_eq!(step, "build");
        }
        other => panic!("unexpected error: {other}"),
    }
    let deployment = ctx.deployment();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.failed_step.as_deref(), Some("build"));
    assert!(deployment
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("returned 2")));
    assert!(f.h.engine.names().is_empty());

    let lock = DistributedLock::new(f.kv.clone(), "r1", Duration::from_millis(100));
    lock.lock().await.unwrap();
}

#[tokio::test]
async fn test_missing_sources_fail_the_clone_step() {
    let mut web = resource("r1", "web", 1);
    web.build_meta = BuildMeta::LocalDirectory(LocalBuildMeta {
        path: "/nonexistent/dockside/sources".into(),
        dockerfile: "Dockerfile".to_string(),
    });
    let f = fixture(&web, Duration::from_secs(5));

    let ctx = BuildContext::new("r1", "b4");
    let err = f.pipeline.deploy(&web, &ctx).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Build { step, .. } if step == "clone"));
    assert_eq!(ctx.deployment().failed_step.as_deref(), Some("clone"));
    assert!(f.h.engine.builds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_build_while_building() {
    let web = resource("r1", "web", 1);
    let f = fixture(&web, Duration::from_secs(5));
    f.h.engine.hold_build.store(true, Ordering::SeqCst);

    let ctx = Arc::new(BuildContext::new("r1", "b5"));
    let attempt = {
        let pipeline = f.pipeline.clone();
        let ctx = ctx.clone();
        let web = web.clone();
        tokio::spawn(async move { pipeline.deploy(&web, &ctx).await })
    };

    let cancelled = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if ctx.cancel_build().unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(cancelled.is_ok());

    let result = tokio::time::timeout(Duration::from_secs(2), attempt)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(OrchestratorError::Build { step, .. }) if step == "build"));
    assert!(f.h.engine.build_cancelled.load(Ordering::SeqCst));
    assert_eq!(ctx.deployment().status, DeploymentStatus::Failed);
}
