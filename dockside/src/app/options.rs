//! Application configuration options

use std::time::Duration;

use crate::bus::mqtt::MqttAddress;
use crate::deploy::lifecycle::LifecycleOptions as ContainerOptions;
use crate::deploy::pipeline::PipelineOptions;
use crate::logstream::watchdog::WatchdogOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Docker binary
    pub docker_binary: String,

    /// Container placement on this server
    pub containers: ContainerOptions,

    pub kv: KvBackend,

    pub bus: BusBackend,

    pub pipeline: PipelineOptions,

    pub watchdog: WatchdogOptions,

    /// Background jobs
    pub jobs: JobOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        let storage = StorageOptions::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            docker_binary: "docker".to_string(),
            containers: ContainerOptions::default(),
            kv: KvBackend::Memory,
            bus: BusBackend::Local,
            pipeline: PipelineOptions {
                workspaces_dir: storage.layout.workspaces_dir().path().to_path_buf(),
                ..Default::default()
            },
            watchdog: WatchdogOptions::default(),
            jobs: JobOptions::default(),
            storage,
        }
    }
}

impl AppOptions {
    /// Options for the settings file of `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let kv = match &settings.kv.redis_url {
            Some(url) => KvBackend::Redis {
                url: url.clone(),
                key_prefix: settings.kv.key_prefix.clone(),
            },
            None => KvBackend::Memory,
        };

        let broker = &settings.mqtt_broker;
        let bus = if broker.host.is_empty() {
            BusBackend::Local
        } else {
            BusBackend::Mqtt(MqttAddress {
                host: broker.host.clone(),
                port: broker.port,
                use_tls: broker.tls,
                ca_cert_path: broker.ca_cert_path.clone(),
                username: broker.username.clone(),
                password: broker.password.clone(),
            })
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            docker_binary: settings.docker.binary.clone(),
            containers: ContainerOptions {
                server_id: settings.server_id.clone(),
                advertised_host: settings.advertised_host.clone(),
                base_port: settings.docker.base_port,
                container_port: settings.docker.container_port,
                log_max_size: settings.docker.log_max_size.clone(),
            },
            kv,
            bus,
            pipeline: PipelineOptions {
                namespace: settings.namespace.clone(),
                lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
                run_log_base_url: settings.run_log_base_url.clone(),
                workspaces_dir: layout.workspaces_dir().path().to_path_buf(),
            },
            watchdog: WatchdogOptions {
                namespace: settings.namespace.clone(),
                tick: Duration::from_secs(settings.watchdog_tick_secs.max(1)),
            },
            jobs: JobOptions {
                routing_interval: Duration::from_secs(settings.jobs.routing_interval_secs),
                health_interval: Duration::from_secs(settings.jobs.health_interval_secs),
                crash_recovery: settings.jobs.crash_recovery,
                lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
            },
            storage: StorageOptions { layout },
        }
    }
}

/// Key-value store backing the deploy locks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvBackend {
    Memory,
    Redis { url: String, key_prefix: String },
}

/// Pub/sub bus carrying log lines
#[derive(Debug, Clone)]
pub enum BusBackend {
    Local,
    Mqtt(MqttAddress),
}

/// Lifecycle options for the process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// Background job options
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub routing_interval: Duration,
    pub health_interval: Duration,

    /// Run crashed resources again before each health check
    pub crash_recovery: bool,

    /// Deploy lock timeout, shared with the build pipeline
    pub lock_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            routing_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(10),
            crash_recovery: true,
            lock_timeout: Duration::from_secs(600),
        }
    }
}
