//! Fleet registry
//!
//! Servers, resources and route blocks. The orchestrator only writes the
//! per-server detail of a resource, everything else is read-only here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::resource::{Resource, RouteBlock, Server, ServerDetail};

/// Read access to the fleet plus the single mutation the lifecycle manager needs
#[async_trait]
pub trait Registry: Send + Sync {
    async fn server(&self, id: &str) -> Result<Server, OrchestratorError>;

    async fn resource(&self, id: &str) -> Result<Resource, OrchestratorError>;

    async fn resources(&self) -> Result<Vec<Resource>, OrchestratorError>;

    async fn route_blocks(&self) -> Result<Vec<RouteBlock>, OrchestratorError>;

    /// Replace (or add) the detail of `resource_id` for `detail.server_id`
    async fn update_server_detail(
        &self,
        resource_id: &str,
        detail: ServerDetail,
    ) -> Result<(), OrchestratorError>;
}

/// Snapshot of the whole fleet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fleet {
    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default)]
    pub resources: Vec<Resource>,

    #[serde(default)]
    pub route_blocks: Vec<RouteBlock>,
}

/// Registry held in memory, optionally backed by a JSON file
pub struct MemoryRegistry {
    fleet: RwLock<Fleet>,
    file: Option<File>,
}

impl MemoryRegistry {
    pub fn new(fleet: Fleet) -> Self {
        Self {
            fleet: RwLock::new(fleet),
            file: None,
        }
    }

    /// Load the fleet from `file`; a missing file starts an empty fleet.
    /// Every update is written back to the same file.
    pub async fn load(file: File) -> Result<Self, OrchestratorError> {
        let fleet = if file.exists().await {
            let fleet: Fleet = file.read_json().await?;
            info!(
                "Loaded fleet from {}: {} servers, {} resources, {} route blocks",
                file.path().display(),
                fleet.servers.len(),
                fleet.resources.len(),
                fleet.route_blocks.len()
            );
            fleet
        } else {
            info!("No fleet file at {}, starting empty", file.path().display());
            Fleet::default()
        };

        Ok(Self {
            fleet: RwLock::new(fleet),
            file: Some(file),
        })
    }

    pub async fn snapshot(&self) -> Fleet {
        self.fleet.read().await.clone()
    }

    async fn persist(&self, fleet: &Fleet) -> Result<(), OrchestratorError> {
        if let Some(file) = &self.file {
            file.write_json(fleet).await?;
            debug!("Persisted fleet to {}", file.path().display());
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn server(&self, id: &str) -> Result<Server, OrchestratorError> {
        let fleet = self.fleet.read().await;
        fleet
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("server {}", id)))
    }

    async fn resource(&self, id: &str) -> Result<Resource, OrchestratorError> {
        let fleet = self.fleet.read().await;
        fleet
            .resources
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ResourceNotFound(id.to_string()))
    }

    async fn resources(&self) -> Result<Vec<Resource>, OrchestratorError> {
        Ok(self.fleet.read().await.resources.clone())
    }

    async fn route_blocks(&self) -> Result<Vec<RouteBlock>, OrchestratorError> {
        Ok(self.fleet.read().await.route_blocks.clone())
    }

    async fn update_server_detail(
        &self,
        resource_id: &str,
        detail: ServerDetail,
    ) -> Result<(), OrchestratorError> {
        let mut fleet = self.fleet.write().await;
        let resource = fleet
            .resources
            .iter_mut()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| OrchestratorError::ResourceNotFound(resource_id.to_string()))?;

        match resource
            .server_details
            .iter_mut()
            .find(|d| d.server_id == detail.server_id)
        {
            Some(existing) => *existing = detail,
            None => resource.server_details.push(detail),
        }

        self.persist(&fleet).await
    }
}
