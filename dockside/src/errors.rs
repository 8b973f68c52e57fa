//! Error types for the Dockside orchestrator

use thiserror::Error;

use crate::engine::EngineError;
use crate::kv::KvError;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lock timeout: could not acquire lock '{0}'")]
    LockTimeout(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Port allocation for {container} kept racing after {attempts} attempts")]
    PortRace { container: String, attempts: u32 },

    #[error("Build of resource {resource_id} failed at step '{step}': {source}")]
    Build {
        resource_id: String,
        step: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Checkout error: {0}")]
    CheckoutError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Wrap an error with the resource and pipeline step it came from
    pub fn in_step(self, resource_id: &str, step: impl Into<String>) -> Self {
        OrchestratorError::Build {
            resource_id: resource_id.to_string(),
            step: step.into(),
            source: Box::new(self),
        }
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        // keep the context chain
        OrchestratorError::Internal(format!("{:#}", err))
    }
}
