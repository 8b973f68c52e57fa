//! Reverse-proxy routing table
//!
//! The builder compiles the live upstreams of every route block into the
//! staged set of a [`LoadBalancer`]; applying the staged set makes it live.

pub mod balancer;
pub mod builder;
pub mod matcher;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::resource::{PathMatch, RouteBlock};
use crate::routing::matcher::RouteMatcher;

/// Metadata attached to a compiled upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamMeta {
    pub resource_id: String,
    pub resource_name: String,
    pub server_id: String,
    pub block: RouteBlock,
}

/// A routable endpoint
#[derive(Debug, Clone)]
pub struct ProxyUpstream {
    pub id: String,
    pub url: Url,
    pub meta: UpstreamMeta,
    pub matcher: RouteMatcher,
}

impl ProxyUpstream {
    /// Whether this upstream serves `req`
    pub fn matches<B>(&self, req: &http::Request<B>) -> bool {
        self.matcher.matches(req)
    }

    pub fn entry(&self) -> RouteEntry {
        RouteEntry {
            id: self.id.clone(),
            url: self.url.to_string(),
            resource_id: self.meta.resource_id.clone(),
            server_id: self.meta.server_id.clone(),
            route_block_id: self.meta.block.id.clone(),
            hostname: self.meta.block.hostname.clone(),
            path: self.meta.block.path.clone(),
            path_match: self.meta.block.path_match,
        }
    }
}

/// Serialized form of an upstream, as written for the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub id: String,
    pub url: String,
    pub resource_id: String,
    pub server_id: String,
    pub route_block_id: String,
    pub hostname: String,
    pub path: String,
    pub path_match: PathMatch,
}

/// Compiled routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub upstreams: Vec<RouteEntry>,
}
