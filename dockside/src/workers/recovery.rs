//! Crash recovery
//!
//! A resource recorded as running on this server whose containers are all
//! gone is run again. Instances that are still up are left alone. Resources
//! whose deploy lock is held are skipped: a deploy may be replacing their
//! containers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::lifecycle::{ContainerLifecycleManager, RunOptions};
use crate::errors::OrchestratorError;
use crate::kv::lock::DistributedLock;
use crate::kv::KvStore;
use crate::models::resource::{Resource, RunStatus};
use crate::registry::Registry;

/// Returns the ids of the resources that were run again. `lock_timeout`
/// must match the deploy lock timeout, it is the TTL of the lock bucket.
pub async fn recover(
    lifecycle: &ContainerLifecycleManager,
    registry: &Arc<dyn Registry>,
    kv: &Arc<dyn KvStore>,
    lock_timeout: Duration,
) -> Result<Vec<String>, OrchestratorError> {
    let server_id = &lifecycle.options().server_id;
    let mut recovered = Vec::new();

    for resource in registry.resources().await? {
        let recorded_running = resource
            .server_detail(server_id)
            .is_some_and(|d| d.run_status == RunStatus::Running);
        if !recorded_running {
            continue;
        }
        if lifecycle.run_status(&resource).await != RunStatus::NotRunning {
            continue;
        }

        let lock = DistributedLock::new(kv.clone(), &resource.id, lock_timeout);
        match lock.try_lock().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Resource {} is locked by a deploy, skipping recovery", resource.id);
                continue;
            }
            Err(e) => {
                warn!("Unable to lock resource {}: {}", resource.id, e);
                continue;
            }
        }

        let result = run_again(lifecycle, &resource).await;
        if let Err(e) = lock.unlock().await {
            warn!("Failed to release lock {}: {}", lock.key(), e);
        }
        match result {
            Ok(true) => recovered.push(resource.id.clone()),
            Ok(false) => {}
            Err(e) => error!("Failed to recover resource {}: {}", resource.id, e),
        }
    }

    Ok(recovered)
}

/// Run `resource` unless a deploy brought it back while the lock was free
async fn run_again(
    lifecycle: &ContainerLifecycleManager,
    resource: &Resource,
) -> Result<bool, OrchestratorError> {
    if lifecycle.run_status(resource).await != RunStatus::NotRunning {
        return Ok(false);
    }

    info!("Resource {} crashed, running it again", resource.id);
    let opts = RunOptions {
        ignore_if_running: true,
        ..Default::default()
    };
    lifecycle.run(resource, opts).await?;
    Ok(true)
}
