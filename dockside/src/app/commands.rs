//! One-shot commands run from the command line

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::state::AppState;
use crate::bus::topics::Topics;
use crate::deploy::pipeline::BuildContext;
use crate::errors::OrchestratorError;
use crate::models::deployment::{BuildLogLine, Deployment};
use crate::routing::RouteTable;
use crate::utils::generate_uuid;
use crate::workers;

/// Build and run a resource, printing its build log. The shutdown signal
/// cancels the image build and ends the attempt.
pub async fn deploy(
    state: &AppState,
    namespace: &str,
    resource_id: &str,
    shutdown_signal: impl Future<Output = ()>,
) -> Result<Deployment, OrchestratorError> {
    let resource = state.registry.resource(resource_id).await?;
    let ctx = BuildContext::new(&resource.id, generate_uuid());
    info!("Deploying resource {} (build {})", resource.id, ctx.build_id);

    let printing = CancellationToken::new();
    let subscription = state
        .bus
        .subscribe(&Topics::build_logs(namespace, &resource.id))
        .await?
        .until_cancelled(printing.clone());
    let printer = tokio::spawn(async move {
        let mut subscription = subscription;
        while let Some(payload) = subscription.next().await {
            match serde_json::from_slice::<BuildLogLine>(&payload) {
                Ok(line) => println!("[{}] {}", line.level, line.message),
                Err(e) => warn!("Malformed build log line: {}", e),
            }
        }
    });

    let attempt = state.pipeline.deploy(&resource, &ctx);
    tokio::pin!(attempt);
    let result = tokio::select! {
        result = &mut attempt => result,
        _ = shutdown_signal => {
            info!("Cancelling build {}", ctx.build_id);
            if let Err(e) = ctx.cancel_build() {
                warn!("Failed to cancel build {}: {}", ctx.build_id, e);
            }
            ctx.cancel.cancel();
            attempt.await
        }
    };

    printing.cancel();
    if let Err(e) = printer.await {
        warn!("Build log printer failed: {}", e);
    }
    result
}

/// Stop every instance of a resource
pub async fn stop(state: &AppState, resource_id: &str) -> Result<(), OrchestratorError> {
    let resource = state.registry.resource(resource_id).await?;
    state.lifecycle.stop(&resource).await
}

/// Print the run log of a resource until the shutdown signal
pub async fn logs(
    state: &AppState,
    resource_id: &str,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OrchestratorError> {
    let resource = state.registry.resource(resource_id).await?;

    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal.await;
            cancel.cancel();
        })
    };

    let result = state
        .watchdog
        .stream(&resource, cancel, |line| {
            println!("{} {} {}", line.timestamp.to_rfc3339(), line.container, line.message)
        })
        .await;
    stopper.abort();
    result
}

/// Refresh the routing table once and return it
pub async fn routes(state: &AppState) -> Result<RouteTable, OrchestratorError> {
    workers::routing::refresh(&state.routing, &state.balancer, &state.layout.routes_file()).await
}
