//! Container engine abstraction
//!
//! The orchestrator only needs a handful of primitives from the engine:
//! container CRUD by name, log streaming from a timestamp and image builds.
//! `DockerCli` implements them on top of the `docker` binary.

pub mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Errors reported by the container engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("port is already allocated: {0}")]
    PortAllocated(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Classify an engine failure message
    pub fn classify(message: &str) -> Self {
        let msg = message.trim().to_string();
        let lower = msg.to_lowercase();
        if lower.contains("port is already allocated") {
            EngineError::PortAllocated(msg)
        } else if lower.contains("address already in use") {
            EngineError::AddressInUse(msg)
        } else if lower.contains("conflict") || lower.contains("is already in use by container")
        {
            EngineError::Conflict(msg)
        } else if lower.contains("no such")
            || lower.contains("not found")
            || lower.contains("unable to find image")
        {
            EngineError::NotFound(msg)
        } else {
            EngineError::Other(msg)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// State of a container as reported by inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub running: bool,
    pub status: String,

    /// Host port published for the container port, when known
    pub host_port: Option<u16>,
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,

    /// Host port bound to the container port
    pub host_port: u16,
    pub container_port: u16,

    /// json-file log rotation size, e.g. "10m"
    pub log_max_size: String,

    pub labels: HashMap<String, String>,
}

/// A single line of container output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub container: String,
    pub message: String,
}

/// Destination for streamed container output
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, line: LogLine) -> Result<(), EngineError>;
}

#[async_trait]
impl LogSink for mpsc::UnboundedSender<LogLine> {
    async fn write(&self, line: LogLine) -> Result<(), EngineError> {
        self.send(line)
            .map_err(|_| EngineError::Other("log receiver dropped".to_string()))
    }
}

/// Image build request
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Build context directory
    pub context_dir: PathBuf,

    /// Dockerfile relative to the context directory
    pub dockerfile: String,

    /// Engine-side build identifier
    pub build_id: String,

    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Cancels a running image build
pub type CancelFn = Box<dyn FnOnce() -> Result<(), EngineError> + Send>;

/// Container engine client
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine is reachable, returns its version
    async fn ping(&self) -> Result<String, EngineError>;

    async fn inspect(&self, name: &str) -> Result<ContainerState, EngineError>;

    /// List containers (running or not) whose name starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerState>, EngineError>;

    /// Create a container, returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, name: &str) -> Result<(), EngineError>;

    async fn stop(&self, name: &str) -> Result<(), EngineError>;

    async fn remove(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Follow a container's combined stdout/stderr, blocking until the stream
    /// ends or `cancel` fires
    async fn stream_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;

    /// Build an image. The engine hands a cancel function to `cancel_tx` once
    /// the build is underway; build output goes to `progress`.
    async fn build_image(
        &self,
        request: ImageBuildRequest,
        progress: mpsc::UnboundedSender<String>,
        cancel_tx: oneshot::Sender<CancelFn>,
    ) -> Result<(), EngineError>;
}
