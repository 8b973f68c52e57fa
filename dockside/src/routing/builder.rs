//! Routing table compilation

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::errors::OrchestratorError;
use crate::models::resource::{Resource, RouteBlock, RunStatus};
use crate::registry::Registry;
use crate::routing::balancer::LoadBalancer;
use crate::routing::matcher::RouteMatcher;
use crate::routing::{ProxyUpstream, RouteEntry, RouteTable, UpstreamMeta};

/// Deterministic id of an upstream; a leading colon on the port is ignored
pub fn upstream_id(resource_id: &str, server_id: &str, port: &str) -> String {
    let port = port.strip_prefix(':').unwrap_or(port);
    format!("upstream-res-{}-ser-{}-port-{}", resource_id, server_id, port)
}

/// Compiles fleet state into load balancer upstreams
pub struct RoutingTableBuilder {
    registry: Arc<dyn Registry>,
}

impl RoutingTableBuilder {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Stage the live upstreams of `resource` for `block`. Returns how many
    /// upstreams were staged.
    pub async fn append(
        &self,
        resource: &Resource,
        block: &RouteBlock,
        lb: &LoadBalancer,
    ) -> usize {
        let mut staged = 0;
        for detail in &resource.server_details {
            if detail.run_status == RunStatus::NotRunning {
                continue;
            }
            let server = match self.registry.server(&detail.server_id).await {
                Ok(server) => server,
                Err(e) => {
                    debug!("Skipping server {}: {}", detail.server_id, e);
                    continue;
                }
            };
            if !server.is_accessible() {
                continue;
            }

            for up in &detail.upstreams {
                let url = match Url::parse(&format!("http://{}:{}", up.host, up.port())) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!("Invalid upstream {}:{} for {}: {}", up.host, up.port, resource.id, e);
                        continue;
                    }
                };
                lb.add_staged(ProxyUpstream {
                    id: upstream_id(&resource.id, &server.id, &up.port),
                    url,
                    meta: UpstreamMeta {
                        resource_id: resource.id.clone(),
                        resource_name: resource.name.clone(),
                        server_id: server.id.clone(),
                        block: block.clone(),
                    },
                    matcher: RouteMatcher::compile(block),
                });
                staged += 1;
            }
        }
        staged
    }

    /// Compile every route block of the registry and make it live
    pub async fn refresh(&self, lb: &LoadBalancer) -> Result<RouteTable, OrchestratorError> {
        let blocks = self.registry.route_blocks().await?;
        lb.clear_staged();
        for block in &blocks {
            match self.registry.resource(&block.resource_id).await {
                Ok(resource) => {
                    self.append(&resource, block, lb).await;
                }
                Err(e) => warn!("Skipping route block {}: {}", block.id, e),
            }
        }
        lb.apply_staged();

        Ok(RouteTable {
            generated_at: chrono::Utc::now(),
            upstreams: lb.live().iter().map(ProxyUpstream::entry).collect::<Vec<RouteEntry>>(),
        })
    }
}
