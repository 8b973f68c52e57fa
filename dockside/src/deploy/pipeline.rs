//! Build pipeline
//!
//! One attempt runs `connect → clone → build → run` under the distributed
//! lock of the resource. Every step writes a line to the build-log topic and
//! the attempt's [`Deployment`] is observable through a watch channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bus::topics::Topics;
use crate::bus::PubSub;
use crate::deploy::fsm::{BuildEvent, BuildFsm, BuildStep};
use crate::deploy::lifecycle::{ContainerLifecycleManager, RunOptions, RESOURCE_LABEL};
use crate::engine::{CancelFn, ImageBuildRequest};
use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::kv::lock::DistributedLock;
use crate::kv::KvStore;
use crate::models::deployment::{BuildLogLine, Deployment, DeploymentStatus};
use crate::models::resource::Resource;

/// Label carrying the build id on built images
pub const BUILD_LABEL: &str = "dockside.build.id";

/// Build pipeline options
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Topic namespace
    pub namespace: String,

    /// How long an attempt waits for the resource lock, also the lock TTL
    pub lock_timeout: Duration,

    /// Base URL of the web UI, used for the run-log link
    pub run_log_base_url: String,

    /// Directory holding one source checkout per resource
    pub workspaces_dir: PathBuf,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            namespace: "dockside".to_string(),
            lock_timeout: Duration::from_secs(600),
            run_log_base_url: "http://localhost:3000".to_string(),
            workspaces_dir: std::env::temp_dir().join("dockside-workspaces"),
        }
    }
}

/// Link to the live run-log view of a resource
pub fn run_log_url(base: &str, resource_id: &str) -> Result<String, OrchestratorError> {
    let base = format!("{}/", base.trim_end_matches('/'));
    let mut url = Url::parse(&base)
        .and_then(|u| u.join("resource/run-log"))
        .map_err(|e| OrchestratorError::ConfigError(format!("Invalid run log base URL: {}", e)))?;
    url.query_pairs_mut().append_pair("id", resource_id);
    Ok(url.to_string())
}

/// Handle on one build attempt, shared with whoever triggered it
pub struct BuildContext {
    pub build_id: String,

    /// Ends the attempt's context; does not kill a running image build
    pub cancel: CancellationToken,

    deployment: watch::Sender<Deployment>,
    cancel_build: Mutex<Option<CancelFn>>,
}

impl BuildContext {
    pub fn new(resource_id: &str, build_id: impl Into<String>) -> Self {
        let build_id = build_id.into();
        let (deployment, _) = watch::channel(Deployment::start(resource_id, build_id.clone()));
        Self {
            build_id,
            cancel: CancellationToken::new(),
            deployment,
            cancel_build: Mutex::new(None),
        }
    }

    /// Follow the deployment state of this attempt
    pub fn subscribe(&self) -> watch::Receiver<Deployment> {
        self.deployment.subscribe()
    }

    pub fn deployment(&self) -> Deployment {
        self.deployment.borrow().clone()
    }

    /// Cancel the image build if one is underway. Returns whether a cancel
    /// action was available.
    pub fn cancel_build(&self) -> Result<bool, OrchestratorError> {
        let cancel = self
            .cancel_build
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match cancel {
            Some(cancel) => {
                cancel()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn adopt_cancel(&self, cancel: CancelFn) {
        *self.cancel_build.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel);
    }

    fn clear_cancel(&self) {
        self.cancel_build
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn finish(&self, status: DeploymentStatus, error_message: Option<String>) {
        self.deployment
            .send_if_modified(|deployment| deployment.finish(status, error_message));
    }

    /// Publish the final state of `fsm`; `step` is where a failure happened
    fn finish_with(&self, fsm: &BuildFsm, step: BuildStep) {
        self.deployment.send_if_modified(|deployment| {
            let finished = deployment.finish(fsm.status(), fsm.error().map(str::to_string));
            if finished && fsm.step() == BuildStep::Failed {
                deployment.failed_step = Some(step.as_str().to_string());
            }
            finished
        });
    }
}

/// Builds images from source and runs them
pub struct BuildPipeline {
    lifecycle: Arc<ContainerLifecycleManager>,
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn PubSub>,
    options: PipelineOptions,
}

/// Publishes build log lines of one attempt
#[derive(Clone)]
struct BuildLog {
    bus: Arc<dyn PubSub>,
    topic: String,
    build_id: String,
}

impl BuildLog {
    async fn write(&self, level: &str, message: impl Into<String>) {
        let line = BuildLogLine {
            build_id: self.build_id.clone(),
            level: level.to_string(),
            message: message.into(),
        };
        match level {
            "error" => error!("[build {}] {}", self.build_id, line.message),
            _ => info!("[build {}] {}", self.build_id, line.message),
        }
        let payload = match serde_json::to_vec(&line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode build log line: {}", e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.topic, payload).await {
            warn!("Failed to publish build log line: {}", e);
        }
    }

    async fn info(&self, message: impl Into<String>) {
        self.write("info", message).await
    }

    async fn error(&self, message: impl Into<String>) {
        self.write("error", message).await
    }

    /// Forward raw output lines (git, docker build) until every sender is gone
    fn forward(&self) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let log = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                debug!("[build {}] {}", log.build_id, line);
                log.write("output", line).await;
            }
        });
        (tx, handle)
    }
}

impl BuildPipeline {
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn PubSub>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            lifecycle,
            kv,
            bus,
            options,
        }
    }

    /// Run one build attempt of `resource`
    pub async fn deploy(
        &self,
        resource: &Resource,
        ctx: &BuildContext,
    ) -> Result<Deployment, OrchestratorError> {
        let log = BuildLog {
            bus: self.bus.clone(),
            topic: Topics::build_logs(&self.options.namespace, &resource.id),
            build_id: ctx.build_id.clone(),
        };

        let lock = DistributedLock::new(self.kv.clone(), &resource.id, self.options.lock_timeout);
        if let Err(e) = lock.lock().await {
            log.error(format!("Another deployment of {} is in progress", resource.name))
                .await;
            ctx.finish(DeploymentStatus::Failed, Some(e.to_string()));
            return Err(e);
        }

        let mut fsm = BuildFsm::new();
        let result = self.run_steps(resource, ctx, &log, &mut fsm).await;
        ctx.clear_cancel();

        if let Err(e) = lock.unlock().await {
            warn!("Failed to release lock {}: {}", lock.key(), e);
        }

        let step = fsm.step();
        match result {
            Ok(()) => {
                ctx.finish_with(&fsm, step);
                Ok(ctx.deployment())
            }
            Err(e) => {
                if let Err(invalid) = fsm.process(BuildEvent::Fail(e.to_string())) {
                    error!("Build {} of {}: {}", ctx.build_id, resource.id, invalid);
                }
                log.error(format!("Build failed during {}: {}", step.as_str(), e))
                    .await;
                ctx.finish_with(&fsm, step);
                Err(e.in_step(&resource.id, step.as_str()))
            }
        }
    }

    async fn run_steps(
        &self,
        resource: &Resource,
        ctx: &BuildContext,
        log: &BuildLog,
        fsm: &mut BuildFsm,
    ) -> Result<(), OrchestratorError> {
        let advance = |fsm: &mut BuildFsm| {
            fsm.process(BuildEvent::StepDone)
                .map_err(OrchestratorError::Internal)
        };

        // the attempt's own context, ended when the attempt returns
        let attempt = ctx.cancel.child_token();
        let _attempt_guard = attempt.clone().drop_guard();

        log.info("Connecting to Docker...").await;
        let engine = self.lifecycle.engine().clone();
        let version = engine.ping().await?;
        log.info(format!("Connected to Docker {}", version)).await;
        advance(fsm)?;

        let (progress, forwarder) = log.forward();
        let outcome = async {
            log.info("Checking out sources...").await;
            let workspace = Dir::new(&self.options.workspaces_dir).subdir(&resource.id);
            let source = resource.build_meta.run_build(&workspace, &progress).await?;
            advance(fsm)?;

            if attempt.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            log.info("Building image...").await;
            let (cancel_tx, cancel_rx) = oneshot::channel::<CancelFn>();
            let watcher = {
                let attempt = attempt.clone();
                async move {
                    tokio::select! {
                        _ = attempt.cancelled() => None,
                        cancel = cancel_rx => cancel.ok(),
                    }
                }
            };

            let request = ImageBuildRequest {
                context_dir: source.directory,
                dockerfile: source.dockerfile,
                build_id: format!("{}-{}", resource.id, ctx.build_id),
                tags: vec![format!("{}:latest", resource.image_name())],
                labels: HashMap::from([
                    (RESOURCE_LABEL.to_string(), resource.id.clone()),
                    (BUILD_LABEL.to_string(), ctx.build_id.clone()),
                ]),
            };
            let build = engine.build_image(request, progress.clone(), cancel_tx);
            tokio::pin!(build);

            // adopt the cancel action while the build runs
            let adopt = async {
                if let Some(cancel) = watcher.await {
                    debug!("Build {} is now cancellable", ctx.build_id);
                    ctx.adopt_cancel(cancel);
                }
                std::future::pending::<()>().await
            };
            tokio::select! {
                result = &mut build => result?,
                _ = adopt => {}
            }
            ctx.clear_cancel();
            advance(fsm)?;
            Ok(())
        }
        .await;
        drop(progress);
        if let Err(e) = forwarder.await {
            warn!("Build log forwarder failed: {}", e);
        }
        outcome?;

        log.info("Starting container...").await;
        self.lifecycle
            .run(
                resource,
                RunOptions {
                    remove_existing: true,
                    ..Default::default()
                },
            )
            .await?;
        log.info("Container successfully started.").await;
        log.info(format!(
            "View run logs: {}",
            run_log_url(&self.options.run_log_base_url, &resource.id)?
        ))
        .await;
        advance(fsm)?;
        Ok(())
    }
}
