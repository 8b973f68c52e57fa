//! Routing table tests

use std::sync::Arc;

use dockside::models::resource::{PathMatch, Resource, RunStatus};
use dockside::registry::{Fleet, MemoryRegistry};
use dockside::routing::balancer::LoadBalancer;
use dockside::routing::builder::RoutingTableBuilder;

use crate::support::{detail, resource, route_block, server};

fn running(id: &str, details: Vec<dockside::models::resource::ServerDetail>) -> Resource {
    let mut r = resource(id, "web", 1);
    r.server_details = details;
    r
}

fn fleet(resources: Vec<Resource>) -> Fleet {
    Fleet {
        servers: vec![
            server("s1", "10.0.0.1", true),
            server("s2", "10.0.0.2", true),
            server("s3", "10.0.0.3", false),
        ],
        resources,
        route_blocks: vec![
            route_block("b1", "r1", "app.example.com"),
            route_block("b2", "r2", "api.example.com"),
        ],
    }
}

fn builder(fleet: Fleet) -> RoutingTableBuilder {
    RoutingTableBuilder::new(Arc::new(MemoryRegistry::new(fleet)))
}

#[tokio::test]
async fn test_refresh_is_idempotent_and_order_insensitive() {
    let r1 = running(
        "r1",
        vec![
            detail("s1", RunStatus::Running, &[4000, 4001]),
            detail("s2", RunStatus::Running, &[4000]),
        ],
    );
    let r2 = running("r2", vec![detail("s1", RunStatus::Running, &[5000])]);

    let lb = LoadBalancer::new();
    let forward = builder(fleet(vec![r1.clone(), r2.clone()]));
    let first = forward.refresh(&lb).await.unwrap();
    let second = forward.refresh(&lb).await.unwrap();
    assert_eq!(first.upstreams, second.upstreams);
    assert_eq!(first.upstreams.len(), 4);

    let mut reversed = fleet(vec![r2, r1]);
    reversed.route_blocks.reverse();
    let other_lb = LoadBalancer::new();
    let third = builder(reversed).refresh(&other_lb).await.unwrap();
    assert_eq!(first.upstreams, third.upstreams);

    let ids: Vec<&str> = first.upstreams.iter().map(|u| u.id.as_str()).collect();
    assert!(ids.contains(&"upstream-res-r1-ser-s1-port-4001"));
    assert!(ids.contains(&"upstream-res-r2-ser-s1-port-5000"));
}

#[tokio::test]
async fn test_stopped_or_unreachable_servers_have_no_upstreams() {
    let r1 = running(
        "r1",
        vec![
            detail("s1", RunStatus::NotRunning, &[4000]),
            detail("s3", RunStatus::Running, &[4000]),
            detail("s9", RunStatus::Running, &[4000]),
        ],
    );
    let lb = LoadBalancer::new();
    let b = builder(fleet(vec![r1.clone()]));

    let staged = b
        .append(&r1, &route_block("b1", "r1", "app.example.com"), &lb)
        .await;
    assert_eq!(staged, 0);

    let table = b.refresh(&lb).await.unwrap();
    assert!(table.upstreams.is_empty());
}

#[tokio::test]
async fn test_unknown_status_still_routes() {
    let r1 = running("r1", vec![detail("s2", RunStatus::Unknown, &[4000])]);
    let lb = LoadBalancer::new();
    let table = builder(fleet(vec![r1])).refresh(&lb).await.unwrap();

    assert_eq!(table.upstreams.len(), 1);
    assert_eq!(table.upstreams[0].url, "http://10.0.0.1:4000/");
    assert_eq!(table.upstreams[0].server_id, "s2");
}

#[tokio::test]
async fn test_select_rotates_over_matching_upstreams() {
    let r1 = running(
        "r1",
        vec![
            detail("s1", RunStatus::Running, &[4000]),
            detail("s2", RunStatus::Running, &[4001]),
        ],
    );
    let r2 = running("r2", vec![detail("s1", RunStatus::Running, &[5000])]);
    let lb = LoadBalancer::new();
    builder(fleet(vec![r1, r2])).refresh(&lb).await.unwrap();

    let req = http::Request::builder()
        .uri("/dashboard")
        .header(http::header::HOST, "app.example.com:443")
        .body(())
        .unwrap();
    let a = lb.select(&req).unwrap();
    let b = lb.select(&req).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(a.meta.resource_id, "r1");
    assert_eq!(b.meta.resource_id, "r1");

    let api = http::Request::builder()
        .uri("http://api.example.com/v1/users")
        .body(())
        .unwrap();
    assert_eq!(lb.select(&api).unwrap().meta.resource_id, "r2");

    let unknown = http::Request::builder()
        .uri("http://nope.example.com/")
        .body(())
        .unwrap();
    assert!(lb.select(&unknown).is_none());
}

#[tokio::test]
async fn test_exact_path_block() {
    let r1 = running("r1", vec![detail("s1", RunStatus::Running, &[4000])]);
    let mut f = fleet(vec![r1]);
    f.route_blocks = vec![{
        let mut block = route_block("b1", "r1", "app.example.com");
        block.path = "/health".to_string();
        block.path_match = PathMatch::Exact;
        block
    }];
    let lb = LoadBalancer::new();
    builder(f).refresh(&lb).await.unwrap();

    let hit = http::Request::builder()
        .uri("http://app.example.com/health")
        .body(())
        .unwrap();
    let miss = http::Request::builder()
        .uri("http://app.example.com/health/deep")
        .body(())
        .unwrap();
    assert!(lb.select(&hit).is_some());
    assert!(lb.select(&miss).is_none());
}

#[tokio::test]
async fn test_resource_with_two_route_blocks_serves_both_hosts() {
    let r1 = running("r1", vec![detail("s1", RunStatus::Running, &[4000])]);
    let mut f = fleet(vec![r1]);
    f.route_blocks = vec![
        route_block("b1", "r1", "app.example.com"),
        route_block("b3", "r1", "www.example.com"),
    ];
    let lb = LoadBalancer::new();
    let table = builder(f).refresh(&lb).await.unwrap();

    assert_eq!(table.upstreams.len(), 2);
    let mut blocks: Vec<&str> = table
        .upstreams
        .iter()
        .map(|u| u.route_block_id.as_str())
        .collect();
    blocks.sort();
    assert_eq!(blocks, vec!["b1", "b3"]);
    assert!(table
        .upstreams
        .iter()
        .all(|u| u.id == "upstream-res-r1-ser-s1-port-4000"));

    for host in ["app.example.com", "www.example.com"] {
        let req = http::Request::builder()
            .uri(format!("http://{host}/"))
            .body(())
            .unwrap();
        let picked = lb.select(&req).unwrap();
        assert_eq!(picked.meta.block.hostname, host);
    }
}
