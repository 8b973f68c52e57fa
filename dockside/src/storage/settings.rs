//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Prefix of every pub/sub topic
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Id of the server this process manages containers on
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Host other machines use to reach published container ports
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,

    /// Container engine configuration
    #[serde(default)]
    pub docker: DockerSettings,

    /// Key-value store configuration
    #[serde(default)]
    pub kv: KvSettings,

    /// MQTT broker configuration. An empty host selects the in-process bus.
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Seconds a deploy waits for the resource lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Seconds between two liveness checks of a log stream
    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_secs: u64,

    /// Background job intervals
    #[serde(default)]
    pub jobs: JobSettings,

    /// Base URL of the web UI, used to build run-log links
    #[serde(default = "default_run_log_base_url")]
    pub run_log_base_url: String,
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "dockside".to_string()
}

fn default_server_id() -> String {
    "local".to_string()
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_lock_timeout() -> u64 {
    600
}

fn default_watchdog_tick() -> u64 {
    3
}

fn default_run_log_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            namespace: default_namespace(),
            server_id: default_server_id(),
            advertised_host: default_advertised_host(),
            docker: DockerSettings::default(),
            kv: KvSettings::default(),
            mqtt_broker: MqttBrokerSettings::default(),
            lock_timeout_secs: default_lock_timeout(),
            watchdog_tick_secs: default_watchdog_tick(),
            jobs: JobSettings::default(),
            run_log_base_url: default_run_log_base_url(),
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Docker binary, looked up on PATH when not absolute
    #[serde(default = "default_docker_binary")]
    pub binary: String,

    /// Port the free host port search starts from
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Port applications listen on inside their container
    #[serde(default = "default_base_port")]
    pub container_port: u16,

    /// json-file log rotation size
    #[serde(default = "default_log_max_size")]
    pub log_max_size: String,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_base_port() -> u16 {
    3000
}

fn default_log_max_size() -> String {
    "10m".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            base_port: default_base_port(),
            container_port: default_base_port(),
            log_max_size: default_log_max_size(),
        }
    }
}

/// Key-value store settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSettings {
    /// Redis URL; the in-memory store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of every redis key
    #[serde(default = "default_namespace")]
    pub key_prefix: String,
}

/// MQTT broker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default)]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

/// Background job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Seconds between two routing refreshes
    #[serde(default = "default_routing_interval")]
    pub routing_interval_secs: u64,

    /// Seconds between two health checks
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Run crashed resources again during the health check
    #[serde(default = "default_true")]
    pub crash_recovery: bool,
}

fn default_routing_interval() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    10
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            routing_interval_secs: default_routing_interval(),
            health_interval_secs: default_health_interval(),
            crash_recovery: true,
        }
    }
}
