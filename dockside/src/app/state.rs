//! Application state management

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::options::{AppOptions, BusBackend, KvBackend};
use crate::bus::local::LocalBus;
use crate::bus::mqtt::MqttBus;
use crate::bus::PubSub;
use crate::deploy::lifecycle::{ContainerLifecycleManager, TcpPortFinder};
use crate::deploy::pipeline::BuildPipeline;
use crate::engine::docker::DockerCli;
use crate::engine::ContainerEngine;
use crate::errors::OrchestratorError;
use crate::kv::memory::MemoryKv;
use crate::kv::redis::RedisKv;
use crate::kv::KvStore;
use crate::logstream::watchdog::LogStreamWatchdog;
use crate::registry::{MemoryRegistry, Registry};
use crate::routing::balancer::LoadBalancer;
use crate::routing::builder::RoutingTableBuilder;
use crate::storage::layout::StorageLayout;
use crate::utils::{generate_uuid, CooldownOptions};

/// Main application state
pub struct AppState {
    pub layout: StorageLayout,

    pub engine: Arc<dyn ContainerEngine>,

    /// Lock store
    pub kv: Arc<dyn KvStore>,

    /// Log line bus
    pub bus: Arc<dyn PubSub>,

    pub registry: Arc<dyn Registry>,

    pub lifecycle: Arc<ContainerLifecycleManager>,

    pub pipeline: Arc<BuildPipeline>,

    pub watchdog: Arc<LogStreamWatchdog>,

    pub routing: Arc<RoutingTableBuilder>,

    pub balancer: Arc<LoadBalancer>,

    /// Ends background connections (MQTT event loop)
    pub cancel: CancellationToken,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");

        let layout = options.storage.layout.clone();
        layout.setup().await?;
        let cancel = CancellationToken::new();

        let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(&options.docker_binary));

        let kv: Arc<dyn KvStore> = match &options.kv {
            KvBackend::Memory => {
                info!("Using in-memory key-value store");
                Arc::new(MemoryKv::new())
            }
            KvBackend::Redis { url, key_prefix } => {
                Arc::new(RedisKv::connect(url, key_prefix).await?)
            }
        };

        let bus: Arc<dyn PubSub> = match &options.bus {
            BusBackend::Local => {
                info!("Using in-process pub/sub bus");
                Arc::new(LocalBus::new())
            }
            BusBackend::Mqtt(address) => {
                let client_id = format!(
                    "dockside-{}-{}",
                    options.containers.server_id,
                    generate_uuid()
                );
                Arc::new(MqttBus::connect(
                    address,
                    &client_id,
                    CooldownOptions::default(),
                    cancel.clone(),
                )?)
            }
        };

        let registry: Arc<dyn Registry> =
            Arc::new(MemoryRegistry::load(layout.fleet_file()).await?);

        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            engine.clone(),
            registry.clone(),
            Arc::new(TcpPortFinder),
            options.containers.clone(),
        ));
        let pipeline = Arc::new(BuildPipeline::new(
            lifecycle.clone(),
            kv.clone(),
            bus.clone(),
            options.pipeline.clone(),
        ));
        let watchdog = Arc::new(LogStreamWatchdog::new(
            lifecycle.clone(),
            bus.clone(),
            options.watchdog.clone(),
        ));
        let routing = Arc::new(RoutingTableBuilder::new(registry.clone()));

        Ok(Self {
            layout,
            engine,
            kv,
            bus,
            registry,
            lifecycle,
            pipeline,
            watchdog,
            routing,
            balancer: Arc::new(LoadBalancer::new()),
            cancel,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down application state...");
        self.cancel.cancel();
        Ok(())
    }
}
