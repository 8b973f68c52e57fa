//! Routing refresh: rebuild the live upstream set and write it for the proxy

use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::routing::balancer::LoadBalancer;
use crate::routing::builder::RoutingTableBuilder;
use crate::routing::RouteTable;

/// Refresh `lb` from the registry and write the table to `routes_file`.
/// The file is only rewritten when the upstream set changed.
pub async fn refresh(
    builder: &RoutingTableBuilder,
    lb: &LoadBalancer,
    routes_file: &File,
) -> Result<RouteTable, OrchestratorError> {
    let table = builder.refresh(lb).await?;

    if routes_file.exists().await {
        if let Ok(previous) = routes_file.read_json::<RouteTable>().await {
            if previous.upstreams == table.upstreams {
                debug!("Routing table unchanged ({} upstreams)", table.upstreams.len());
                return Ok(table);
            }
        }
    }

    routes_file.write_json(&table).await?;
    info!(
        "Wrote {} upstream(s) to {}",
        table.upstreams.len(),
        routes_file.path().display()
    );
    Ok(table)
}
