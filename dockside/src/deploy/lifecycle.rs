//! Container lifecycle of a resource on this machine
//!
//! A resource runs as `instance_count()` containers named
//! `<name>-<id>-container-<index>`. Running is idempotent: existing
//! containers are stopped (and optionally removed) before a fresh one is
//! created on a newly allocated host port. A start that loses its port to a
//! concurrent deploy is retried with a new port.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{ContainerEngine, ContainerSpec, EngineError, LogSink};
use crate::errors::OrchestratorError;
use crate::models::resource::{Resource, RunStatus, ServerDetail, Upstream, CONTAINER_PORT};
use crate::registry::Registry;

/// Retries of a per-instance run after its port was raced away
pub const MAX_PORT_RACE_RETRIES: u32 = 50;

/// Label carrying the resource id on every container
pub const RESOURCE_LABEL: &str = "dockside.resource.id";

/// Finds a free host port
pub trait PortFinder: Send + Sync {
    /// First port at or above `from` that can be bound
    fn find_open_port(&self, from: u16) -> Result<u16, OrchestratorError>;
}

/// Probes ports by binding a TCP listener on all interfaces
#[derive(Debug, Default, Clone)]
pub struct TcpPortFinder;

impl PortFinder for TcpPortFinder {
    fn find_open_port(&self, from: u16) -> Result<u16, OrchestratorError> {
        (from..=u16::MAX)
            .find(|port| TcpListener::bind(("0.0.0.0", *port)).is_ok())
            .ok_or_else(|| OrchestratorError::Internal(format!("No open port above {}", from)))
    }
}

/// Lifecycle manager options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Server this manager runs containers on
    pub server_id: String,

    /// Host other machines use to reach the published ports
    pub advertised_host: String,

    /// Port the free-port search starts from
    pub base_port: u16,

    /// Port the application listens on inside its container
    pub container_port: u16,

    /// json-file log rotation size
    pub log_max_size: String,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            server_id: "local".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            base_port: 3000,
            container_port: CONTAINER_PORT,
            log_max_size: "10m".to_string(),
        }
    }
}

/// Options of one `run`
#[derive(Clone)]
pub struct RunOptions {
    /// Attach to the container output after start, until the stream ends or
    /// `cancel` fires
    pub stdout: Option<Arc<dyn LogSink>>,

    /// Force remove the existing container before creating a new one
    pub remove_existing: bool,

    /// Leave an instance alone when its container is already running
    pub ignore_if_running: bool,

    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stdout: None,
            remove_existing: false,
            ignore_if_running: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("stdout", &self.stdout.is_some())
            .field("remove_existing", &self.remove_existing)
            .field("ignore_if_running", &self.ignore_if_running)
            .finish()
    }
}

fn tolerate_not_found(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Starts, stops and reconciles the containers of resources on this machine
pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
    ports: Arc<dyn PortFinder>,
    options: LifecycleOptions,
}

impl ContainerLifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn Registry>,
        ports: Arc<dyn PortFinder>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            engine,
            registry,
            ports,
            options,
        }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Run every instance of `resource`, removing instances above the
    /// desired count first. The first failing instance aborts the run.
    pub async fn run(&self, resource: &Resource, opts: RunOptions) -> Result<(), OrchestratorError> {
        let instances = resource.instance_count();
        info!(
            "Running resource {} ({} instance(s), {:?})",
            resource.id, instances, opts
        );

        self.reconcile(resource, instances).await;

        let mut upstreams = Vec::new();
        for index in 0..instances {
            match self.run_instance(resource, index, &opts).await? {
                Some(port) => upstreams.push(Upstream::new(&self.options.advertised_host, port)),
                None => warn!(
                    "No published port known for {}",
                    resource.container_name(index)
                ),
            }
        }

        self.record(resource, RunStatus::Running, upstreams).await;
        Ok(())
    }

    /// Stop every instance of `resource`, aborting on the first error
    pub async fn stop(&self, resource: &Resource) -> Result<(), OrchestratorError> {
        for index in 0..resource.instance_count() {
            let name = resource.container_name(index);
            info!("Stopping container {}", name);
            self.engine.stop(&name).await?;
        }

        self.record(resource, RunStatus::NotRunning, Vec::new()).await;
        Ok(())
    }

    /// `Running` if any instance runs, `Unknown` if the engine could not
    /// answer for some instance, `NotRunning` otherwise
    pub async fn run_status(&self, resource: &Resource) -> RunStatus {
        let mut unknown = false;
        for index in 0..resource.instance_count() {
            let name = resource.container_name(index);
            match self.engine.inspect(&name).await {
                Ok(state) if state.running => return RunStatus::Running,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    debug!("Failed to inspect {}: {}", name, e);
                    unknown = true;
                }
            }
        }

        if unknown {
            RunStatus::Unknown
        } else {
            RunStatus::NotRunning
        }
    }

    /// Remove containers whose index is at or above `instances`. Failures
    /// are logged and skipped. Returns the removed container names.
    pub async fn reconcile(&self, resource: &Resource, instances: u32) -> Vec<String> {
        let existing = match self.engine.list(&resource.container_prefix()).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Failed to list containers of {}: {}", resource.id, e);
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for container in existing {
            let Some(index) = resource.instance_index(&container.name) else {
                continue;
            };
            if index < instances {
                continue;
            }

            info!(
                "Removing extra instance {} of resource {}",
                container.name, resource.id
            );
            let result = match tolerate_not_found(self.engine.stop(&container.name).await) {
                Ok(()) => tolerate_not_found(self.engine.remove(&container.name, true).await),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed.push(container.name),
                Err(e) => warn!("Failed to remove extra instance {}: {}", container.name, e),
            }
        }
        removed
    }

    /// Follow the output of every instance concurrently into `sink`, each
    /// instance from its own entry in `since` (from the start when absent).
    /// Returns once all instance streams have ended.
    pub async fn stream_logs(
        &self,
        resource: &Resource,
        since: &HashMap<String, DateTime<Utc>>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) {
        let streams = (0..resource.instance_count()).map(|index| {
            let name = resource.container_name(index);
            let since = since.get(&name).copied();
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(e) = self.engine.stream_logs(&name, since, sink, cancel).await {
                    warn!("Log stream of {} ended with error: {}", name, e);
                }
            }
        });
        join_all(streams).await;
    }

    /// Run one instance, retrying with a new port when the allocated one was
    /// taken between allocation and start. Returns the published host port.
    async fn run_instance(
        &self,
        resource: &Resource,
        index: u32,
        opts: &RunOptions,
    ) -> Result<Option<u16>, OrchestratorError> {
        let name = resource.container_name(index);
        let mut races: u32 = 0;
        loop {
            match self.try_run_instance(resource, index, opts).await {
                Err(OrchestratorError::Engine(EngineError::PortAllocated(msg))) => {
                    races += 1;
                    error!(
                        "Port is already allocated for {}, trying a different one: {}",
                        name, msg
                    );
                    if races > MAX_PORT_RACE_RETRIES {
                        return Err(OrchestratorError::PortRace {
                            container: name,
                            attempts: races,
                        });
                    }
                    // the container was created with the lost port, drop it
                    tolerate_not_found(self.engine.remove(&name, true).await)?;
                }
                other => return other,
            }
        }
    }

    async fn try_run_instance(
        &self,
        resource: &Resource,
        index: u32,
        opts: &RunOptions,
    ) -> Result<Option<u16>, OrchestratorError> {
        let name = resource.container_name(index);

        if opts.ignore_if_running {
            if let Ok(state) = self.engine.inspect(&name).await {
                if state.running {
                    debug!("Container {} already running", name);
                    return Ok(state.host_port);
                }
            }
        }

        tolerate_not_found(self.engine.stop(&name).await)?;
        if opts.remove_existing {
            tolerate_not_found(self.engine.remove(&name, true).await)?;
        }

        let port = self.ports.find_open_port(self.options.base_port)?;
        let spec = ContainerSpec {
            name: name.clone(),
            image: resource.image_name(),
            host_port: port,
            container_port: self.options.container_port,
            log_max_size: self.options.log_max_size.clone(),
            labels: HashMap::from([(RESOURCE_LABEL.to_string(), resource.id.clone())]),
        };

        let mut adopted = false;
        match self.engine.create(&spec).await {
            Ok(id) => debug!("Created container {} ({}) on port {}", name, id, port),
            Err(EngineError::NotFound(msg)) => {
                warn!("Image for {} not found: {}", name, msg);
                return Err(OrchestratorError::ResourceNotFound(resource.id.clone()));
            }
            Err(EngineError::Conflict(_)) if opts.remove_existing => {
                return Err(OrchestratorError::ContainerAlreadyExists(name));
            }
            Err(EngineError::Conflict(_)) => {
                info!("Container {} already exists, starting it as is", name);
                adopted = true;
            }
            Err(e) => return Err(e.into()),
        }

        match self.engine.start(&name).await {
            Ok(()) => {}
            Err(EngineError::AddressInUse(_)) => return Err(OrchestratorError::PortInUse(port)),
            Err(e) => return Err(e.into()),
        }

        let host_port = if adopted {
            self.engine.inspect(&name).await.ok().and_then(|s| s.host_port)
        } else {
            Some(port)
        };
        info!("Started container {} on port {:?}", name, host_port);

        if let Some(sink) = &opts.stdout {
            self.engine
                .stream_logs(&name, None, sink.clone(), opts.cancel.clone())
                .await?;
        }

        Ok(host_port)
    }

    /// Record this machine's state of `resource` in the registry
    async fn record(&self, resource: &Resource, run_status: RunStatus, upstreams: Vec<Upstream>) {
        let detail = ServerDetail {
            server_id: self.options.server_id.clone(),
            run_status,
            upstreams,
        };
        if let Err(e) = self.registry.update_server_detail(&resource.id, detail).await {
            warn!("Failed to record server detail of {}: {}", resource.id, e);
        }
    }

    /// Update only the run status on this machine's detail, keeping upstreams
    pub async fn record_run_status(
        &self,
        resource: &Resource,
        run_status: RunStatus,
    ) -> Result<(), OrchestratorError> {
        let mut detail = resource
            .server_detail(&self.options.server_id)
            .cloned()
            .unwrap_or_else(|| ServerDetail::new(&self.options.server_id));
        if detail.run_status == run_status {
            return Ok(());
        }
        info!(
            "Run status of {} on {} changed: {:?} -> {:?}",
            resource.id, self.options.server_id, detail.run_status, run_status
        );
        detail.run_status = run_status;
        self.registry
            .update_server_detail(&resource.id, detail)
            .await
    }
}
