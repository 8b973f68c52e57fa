//! Health check of the resources placed on this machine

use std::sync::Arc;

use tracing::{debug, warn};

use crate::deploy::lifecycle::ContainerLifecycleManager;
use crate::errors::OrchestratorError;
use crate::models::resource::RunStatus;
use crate::registry::Registry;

/// Record the observed run status of every resource with a detail on this
/// server. Returns the number of resources whose status changed.
pub async fn check(
    lifecycle: &ContainerLifecycleManager,
    registry: &Arc<dyn Registry>,
) -> Result<usize, OrchestratorError> {
    let server_id = &lifecycle.options().server_id;
    let mut changed = 0;

    for resource in registry.resources().await? {
        let Some(detail) = resource.server_detail(server_id) else {
            continue;
        };

        let observed = lifecycle.run_status(&resource).await;
        if observed == RunStatus::Unknown {
            debug!("Run status of {} unknown, keeping {:?}", resource.id, detail.run_status);
            continue;
        }
        if observed == detail.run_status {
            continue;
        }

        match lifecycle.record_run_status(&resource, observed).await {
            Ok(()) => changed += 1,
            Err(e) => warn!("Failed to record run status of {}: {}", resource.id, e),
        }
    }

    Ok(changed)
}
