//! Background worker tests

use std::sync::Arc;
use std::time::Duration;

use dockside::deploy::lifecycle::RunOptions;
use dockside::filesys::file::File;
use dockside::kv::lock::DistributedLock;
use dockside::kv::memory::MemoryKv;
use dockside::kv::KvStore;
use dockside::models::resource::RunStatus;
use dockside::registry::{Fleet, MemoryRegistry, Registry};
use dockside::routing::balancer::LoadBalancer;
use dockside::routing::builder::RoutingTableBuilder;
use dockside::routing::RouteTable;
use dockside::workers::{health, recovery, routing};

use crate::support::{detail, harness, resource, route_block, server, SERVER_ID};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryKv::new())
}

#[tokio::test]
async fn test_health_check_records_observed_status() {
    let mut crashed = resource("r1", "web", 1);
    crashed.server_details = vec![detail(SERVER_ID, RunStatus::Running, &[4000])];
    let mut elsewhere = resource("r2", "api", 1);
    elsewhere.server_details = vec![detail("s2", RunStatus::Running, &[4000])];
    let h = harness(vec![crashed, elsewhere]);
    let registry: Arc<dyn Registry> = h.registry.clone();

    let changed = health::check(&h.lifecycle, &registry).await.unwrap();

    assert_eq!(changed, 1);
    let r1 = registry.resource("r1").await.unwrap();
    let d = r1.server_detail(SERVER_ID).unwrap();
    assert_eq!(d.run_status, RunStatus::NotRunning);
    // upstreams are kept
    assert_eq!(d.upstreams.len(), 1);
    let r2 = registry.resource("r2").await.unwrap();
    assert_eq!(r2.server_detail("s2").unwrap().run_status, RunStatus::Running);

    assert_eq!(health::check(&h.lifecycle, &registry).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recovery_runs_crashed_resources_again() {
    let mut crashed = resource("r1", "web", 2);
    crashed.server_details = vec![detail(SERVER_ID, RunStatus::Running, &[4000, 4001])];
    let healthy = resource("r2", "api", 1);
    let h = harness(vec![crashed, healthy.clone()]);
    let registry: Arc<dyn Registry> = h.registry.clone();
    h.lifecycle.run(&healthy, RunOptions::default()).await.unwrap();
    let healthy_port = h.engine.container("api-r2-container-0").unwrap().host_port;

    let kv = kv();

    let recovered = recovery::recover(&h.lifecycle, &registry, &kv, LOCK_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(recovered, vec!["r1".to_string()]);
    assert!(h.engine.container("web-r1-container-0").unwrap().running);
    assert!(h.engine.container("web-r1-container-1").unwrap().running);
    assert_eq!(
        h.engine.container("api-r2-container-0").unwrap().host_port,
        healthy_port
    );
    assert_eq!(health::check(&h.lifecycle, &registry).await.unwrap(), 0);
    assert!(recovery::recover(&h.lifecycle, &registry, &kv, LOCK_TIMEOUT)
        .await
        .unwrap()
        .is_empty());

    // the lock was released
    let lock = DistributedLock::new(kv, "r1", LOCK_TIMEOUT);
    assert!(lock.try_lock().await.unwrap());
}

#[tokio::test]
async fn test_recovery_skips_resources_being_deployed() {
    let mut deploying = resource("r1", "web", 1);
    deploying.server_details = vec![detail(SERVER_ID, RunStatus::Running, &[4000])];
    let h = harness(vec![deploying]);
    let registry: Arc<dyn Registry> = h.registry.clone();
    let kv = kv();
    let deploy_lock = DistributedLock::new(kv.clone(), "r1", LOCK_TIMEOUT);
    deploy_lock.lock().await.unwrap();

    let recovered = recovery::recover(&h.lifecycle, &registry, &kv, LOCK_TIMEOUT)
        .await
        .unwrap();

    assert!(recovered.is_empty());
    assert!(h.engine.names().is_empty());
    // still held by the deploy
    assert!(!DistributedLock::new(kv.clone(), "r1", LOCK_TIMEOUT)
        .try_lock()
        .await
        .unwrap());

    deploy_lock.unlock().await.unwrap();
    let recovered = recovery::recover(&h.lifecycle, &registry, &kv, LOCK_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(recovered, vec!["r1".to_string()]);
    assert!(h.engine.container("web-r1-container-0").unwrap().running);
}

#[tokio::test]
async fn test_routing_refresh_writes_table_once_per_change() {
    let mut web = resource("r1", "web", 1);
    web.server_details = vec![detail("s1", RunStatus::Running, &[4000])];
    let registry = Arc::new(MemoryRegistry::new(Fleet {
        servers: vec![server("s1", "10.0.0.1", true)],
        resources: vec![web],
        route_blocks: vec![route_block("b1", "r1", "app.example.com")],
    }));
    let builder = RoutingTableBuilder::new(registry.clone());
    let lb = LoadBalancer::new();
    let tmp = tempfile::tempdir().unwrap();
    let routes_file = File::new(tmp.path().join("routes.json"));

    let first = routing::refresh(&builder, &lb, &routes_file).await.unwrap();
    assert_eq!(first.upstreams.len(), 1);
    let written: RouteTable = routes_file.read_json().await.unwrap();
    assert_eq!(written, first);

    let second = routing::refresh(&builder, &lb, &routes_file).await.unwrap();
    assert_eq!(second.upstreams, first.upstreams);
    let unchanged: RouteTable = routes_file.read_json().await.unwrap();
    assert_eq!(unchanged.generated_at, first.generated_at);

    registry
        .update_server_detail("r1", detail("s1", RunStatus::NotRunning, &[]))
        .await
        .unwrap();
    let third = routing::refresh(&builder, &lb, &routes_file).await.unwrap();
    assert!(third.upstreams.is_empty());
    let rewritten: RouteTable = routes_file.read_json().await.unwrap();
    assert!(rewritten.upstreams.is_empty());
}
