//! Docker engine client driving the `docker` command line

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
    CancelFn, ContainerEngine, ContainerSpec, ContainerState, EngineError, ImageBuildRequest,
    LogLine, LogSink,
};

/// Docker client backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    state: InspectState,
    #[serde(default)]
    network_settings: Option<NetworkSettings>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a docker command to completion, returning stdout
    async fn exec(&self, args: &[String]) -> Result<String, EngineError> {
        debug!("Running {} {}", self.binary, args.join(" "));
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::Other(format!("Failed to run {}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineError::classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn spawn_piped(&self, args: &[String]) -> Result<Child, EngineError> {
        debug!("Spawning {} {}", self.binary, args.join(" "));
        self.command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Other(format!("Failed to run {}: {}", self.binary, e)))
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Split a `docker logs --timestamps` line into its timestamp and message
pub fn parse_log_line(line: &str) -> Option<(DateTime<Utc>, String)> {
    let (ts, message) = line.split_once(' ').unwrap_or((line, ""));
    let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    Some((timestamp, message.to_string()))
}

/// First host port published in a `docker ps` ports column, e.g.
/// `0.0.0.0:3004->3000/tcp, :::3004->3000/tcp`
pub fn parse_published_port(ports: &str) -> Option<u16> {
    ports.split(',').find_map(|mapping| {
        let (host, _) = mapping.trim().split_once("->")?;
        host.rsplit(':').next()?.parse().ok()
    })
}

/// Arguments of `docker create` for a container spec
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--name"]);
    out.push(spec.name.clone());
    out.push("-p".to_string());
    out.push(format!(
        "0.0.0.0:{}:{}/tcp",
        spec.host_port, spec.container_port
    ));
    out.push("--expose".to_string());
    out.push(format!("{}/tcp", spec.container_port));
    out.extend(args(["--log-driver", "json-file", "--log-opt"]));
    out.push(format!("max-size={}", spec.log_max_size));

    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        out.push("--label".to_string());
        out.push(format!("{}={}", key, value));
    }

    out.push(spec.image.clone());
    out
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<String, EngineError> {
        self.exec(&args(["version", "--format", "{{.Server.Version}}"]))
            .await
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState, EngineError> {
        let out = self
            .exec(&args([
                "container",
                "inspect",
                "--format",
                "{{json .}}",
                name,
            ]))
            .await?;
        let inspect: Inspect = serde_json::from_str(&out)
            .map_err(|e| EngineError::Other(format!("Unexpected inspect output: {}", e)))?;
        let host_port = inspect
            .network_settings
            .unwrap_or_default()
            .ports
            .into_values()
            .flatten()
            .flatten()
            .find_map(|binding| binding.host_port.parse().ok());
        Ok(ContainerState {
            name: name.to_string(),
            running: inspect.state.running,
            status: inspect.state.status,
            host_port,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerState>, EngineError> {
        let filter = format!("name=^{}", prefix);
        let out = self
            .exec(&args([
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.Names}}\t{{.State}}\t{{.Ports}}",
            ]))
            .await?;

        Ok(out
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(3, '\t');
                Some((fields.next()?, fields.next()?, fields.next().unwrap_or("")))
            })
            .filter(|(name, _, _)| name.starts_with(prefix))
            .map(|(name, state, ports)| ContainerState {
                name: name.to_string(),
                running: state == "running",
                status: state.to_string(),
                host_port: parse_published_port(ports),
            })
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.exec(&create_args(spec)).await
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.exec(&args(["start", name])).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.exec(&args(["stop", name])).await.map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let mut cmd = args(["rm"]);
        if force {
            cmd.push("--force".to_string());
        }
        cmd.push(name.to_string());
        self.exec(&cmd).await.map(|_| ())
    }

    async fn stream_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut cmd = args(["logs", "--follow", "--timestamps"]);
        if let Some(since) = since {
            cmd.push("--since".to_string());
            cmd.push(since.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
        }
        cmd.push(name.to_string());

        let mut child = self.spawn_piped(&cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Other("docker logs stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Other("docker logs stderr unavailable".to_string()))?;

        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;
        let mut errors = Vec::new();

        while !(out_done && err_done) {
            let (line, from_stderr) = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = stdout.next_line(), if !out_done => (line, false),
                line = stderr.next_line(), if !err_done => (line, true),
            };

            let line = match line {
                Ok(Some(line)) => line,
                _ => {
                    if from_stderr {
                        err_done = true;
                    } else {
                        out_done = true;
                    }
                    continue;
                }
            };

            match parse_log_line(&line) {
                Some((timestamp, message)) => {
                    sink.write(LogLine {
                        timestamp,
                        container: name.to_string(),
                        message,
                    })
                    .await?;
                }
                // Lines without a timestamp are docker's own diagnostics
                None if from_stderr => errors.push(line),
                None => debug!("Dropping unparsable log line from {}", name),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        if !status.success() {
            return Err(EngineError::classify(&errors.join("\n")));
        }
        Ok(())
    }

    async fn build_image(
        &self,
        request: ImageBuildRequest,
        progress: mpsc::UnboundedSender<String>,
        cancel_tx: oneshot::Sender<CancelFn>,
    ) -> Result<(), EngineError> {
        info!(
            "Building image {:?} from {}",
            request.tags,
            request.context_dir.display()
        );

        let mut cmd = args(["build", "--file"]);
        cmd.push(request.dockerfile.clone());
        for tag in &request.tags {
            cmd.push("--tag".to_string());
            cmd.push(tag.clone());
        }
        let mut labels: Vec<_> = request.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            cmd.push("--label".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push("--label".to_string());
        cmd.push(format!("build-ref={}", request.build_id));
        cmd.push(request.context_dir.display().to_string());

        let mut child = self.spawn_piped(&cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Other("docker build stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Other("docker build stderr unavailable".to_string()))?;

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let cancel: CancelFn = Box::new(move || {
            kill_tx
                .send(())
                .map_err(|_| EngineError::Other("build already finished".to_string()))
        });
        if cancel_tx.send(cancel).is_err() {
            debug!("Nobody is waiting for the build cancel handle");
        }

        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;
        let mut tail: Vec<String> = Vec::new();
        let mut kill_open = true;

        while !(out_done && err_done) {
            let (line, from_stderr) = tokio::select! {
                res = &mut kill_rx, if kill_open => {
                    if res.is_ok() {
                        warn!("Cancelling image build {}", request.build_id);
                        let _ = child.kill().await;
                        return Err(EngineError::Other("build cancelled".to_string()));
                    }
                    // cancel handle dropped without being used
                    kill_open = false;
                    continue;
                }
                line = stdout.next_line(), if !out_done => (line, false),
                line = stderr.next_line(), if !err_done => (line, true),
            };

            match line {
                Ok(Some(line)) => {
                    tail.push(line.clone());
                    if tail.len() > 20 {
                        tail.remove(0);
                    }
                    let _ = progress.send(line);
                }
                _ if from_stderr => err_done = true,
                _ => out_done = true,
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        if !status.success() {
            return Err(EngineError::Other(format!(
                "docker build failed: {}",
                tail.join("\n")
            )));
        }

        info!("Successfully built image {:?}", request.tags);
        Ok(())
    }
}
