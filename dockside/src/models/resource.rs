//! Resource and fleet models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::deploy::checkout;
use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;

/// Container port every resource listens on inside its container
pub const CONTAINER_PORT: u16 = 3000;

/// Run status of a resource on one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotRunning,
    Running,
    Unknown,
}

/// A host/port pair a resource exposes on a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: String,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: port.to_string(),
        }
    }

    /// Port without a leading colon
    pub fn port(&self) -> &str {
        self.port.strip_prefix(':').unwrap_or(&self.port)
    }
}

/// Association of a resource with one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetail {
    pub server_id: String,

    #[serde(default)]
    pub run_status: RunStatus,

    #[serde(default)]
    pub upstreams: Vec<Upstream>,
}

impl ServerDetail {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            run_status: RunStatus::NotRunning,
            upstreams: Vec::new(),
        }
    }
}

/// A machine capable of running containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Address the proxy uses to reach this machine
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_true")]
    pub accessible: bool,
}

fn default_true() -> bool {
    true
}

impl Server {
    pub fn is_accessible(&self) -> bool {
        self.accessible
    }
}

/// Image build from a git checkout and a Dockerfile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBuildMeta {
    pub repository_url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// Image build from a directory already present on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBuildMeta {
    pub path: PathBuf,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
}

/// How a resource gets built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildMeta {
    DockerImage(DockerBuildMeta),
    LocalDirectory(LocalBuildMeta),
}

/// Output of the source preparation step of a build
#[derive(Debug, Clone)]
pub struct BuildSource {
    /// Directory the image is built from
    pub directory: PathBuf,

    /// Dockerfile path relative to `directory`
    pub dockerfile: String,
}

impl BuildMeta {
    /// Prepare the sources for this build strategy inside `workspace`
    pub async fn run_build(
        &self,
        workspace: &Dir,
        progress: &tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<BuildSource, OrchestratorError> {
        match self {
            BuildMeta::DockerImage(meta) => {
                let directory = checkout::sync_repository(
                    &meta.repository_url,
                    &meta.branch,
                    workspace.path(),
                    progress,
                )
                .await?;
                Ok(BuildSource {
                    directory,
                    dockerfile: meta.dockerfile.clone(),
                })
            }
            BuildMeta::LocalDirectory(meta) => {
                if !tokio::fs::try_exists(&meta.path).await.unwrap_or(false) {
                    return Err(OrchestratorError::CheckoutError(format!(
                        "Build directory {} does not exist",
                        meta.path.display()
                    )));
                }
                let _ = progress.send(format!("Using sources in {}", meta.path.display()));
                Ok(BuildSource {
                    directory: meta.path.clone(),
                    dockerfile: meta.dockerfile.clone(),
                })
            }
        }
    }
}

/// A deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub instances_per_server: u32,

    #[serde(default)]
    pub server_details: Vec<ServerDetail>,

    pub build_meta: BuildMeta,
}

impl Resource {
    /// Number of instances to run on a server, at least one
    pub fn instance_count(&self) -> u32 {
        self.instances_per_server.max(1)
    }

    /// Image tag built for this resource
    pub fn image_name(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }

    /// Prefix shared by all container names of this resource
    pub fn container_prefix(&self) -> String {
        format!("{}-{}-container-", self.name, self.id)
    }

    /// Deterministic container name of one instance
    pub fn container_name(&self, index: u32) -> String {
        format!("{}{}", self.container_prefix(), index)
    }

    /// Parse the instance index out of a container name of this resource
    pub fn instance_index(&self, container_name: &str) -> Option<u32> {
        container_name
            .trim_start_matches('/')
            .strip_prefix(&self.container_prefix())
            .and_then(|idx| idx.parse().ok())
    }

    pub fn server_detail(&self, server_id: &str) -> Option<&ServerDetail> {
        self.server_details.iter().find(|d| d.server_id == server_id)
    }
}

/// Path matching mode of a route block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    #[default]
    Prefix,
    Exact,
}

/// Routing rule mapping incoming requests to a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBlock {
    pub id: String,
    pub resource_id: String,
    pub hostname: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub path_match: PathMatch,
}

fn default_path() -> String {
    "/".to_string()
}
