//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, JobOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::OrchestratorError;
use crate::workers::job_runner::IntervalJobRunner;
use crate::workers::{health, recovery, routing};

/// Name of the routing refresh job
pub const ROUTING_JOB: &str = "routing-refresh";

/// Name of the health check job
pub const HEALTH_JOB: &str = "health-check";

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OrchestratorError> {
    info!("Initializing Dockside {}...", version);

    let app_state = Arc::new(AppState::init(&options).await?);
    let mut shutdown_manager = ShutdownManager::new(options.lifecycle.clone());
    shutdown_manager.with_app_state(app_state.clone())?;

    let runner = Arc::new(IntervalJobRunner::new());
    register_jobs(&runner, app_state.clone(), &options.jobs);
    let runner_handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };
    shutdown_manager.with_job_runner(runner, runner_handle)?;

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    shutdown_manager.shutdown().await
}

/// Register the background jobs on `runner`
pub fn register_jobs(runner: &IntervalJobRunner, state: Arc<AppState>, options: &JobOptions) {
    {
        let state = state.clone();
        runner.add(ROUTING_JOB, options.routing_interval, move || {
            let state = state.clone();
            async move {
                let routes_file = state.layout.routes_file();
                if let Err(e) = routing::refresh(&state.routing, &state.balancer, &routes_file).await
                {
                    error!("Routing refresh failed: {}", e);
                }
            }
        });
    }

    let crash_recovery = options.crash_recovery;
    let lock_timeout = options.lock_timeout;
    runner.add(HEALTH_JOB, options.health_interval, move || {
        let state = state.clone();
        async move {
            // recovery first: the health check would record crashed resources
            // as not running
            if crash_recovery {
                let recovered = recovery::recover(
                    &state.lifecycle,
                    &state.registry,
                    &state.kv,
                    lock_timeout,
                )
                .await;
                match recovered {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!("Recovered {} resource(s): {:?}", recovered.len(), recovered)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Crash recovery failed: {}", e),
                }
            }
            match health::check(&state.lifecycle, &state.registry).await {
                Ok(changed) if changed > 0 => info!("Health check updated {} resource(s)", changed),
                Ok(_) => {}
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    });
}

// ================================= SHUTDOWN ===================================== //

struct JobRunnerShutdownParams {
    runner: Arc<IntervalJobRunner>,
    handle: JoinHandle<()>,
}

struct ShutdownManager {
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    job_runner: Option<JobRunnerShutdownParams>,
}

impl ShutdownManager {
    pub fn new(lifecycle_options: LifecycleOptions) -> Self {
        Self {
            lifecycle_options,
            app_state: None,
            job_runner: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), OrchestratorError> {
        if self.app_state.is_some() {
            return Err(OrchestratorError::ShutdownError(
                "app_state already set".to_string(),
            ));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_job_runner(
        &mut self,
        runner: Arc<IntervalJobRunner>,
        handle: JoinHandle<()>,
    ) -> Result<(), OrchestratorError> {
        if self.job_runner.is_some() {
            return Err(OrchestratorError::ShutdownError(
                "job_runner already set".to_string(),
            ));
        }
        self.job_runner = Some(JobRunnerShutdownParams { runner, handle });
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        let delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Shutdown timed out after {:?}", delay);
                Err(OrchestratorError::ShutdownError(format!(
                    "timed out after {:?}",
                    delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), OrchestratorError> {
        info!("Shutting down Dockside...");

        // 1. Background jobs, a running iteration completes first
        if let Some(job_runner) = self.job_runner.take() {
            job_runner.runner.stop_all();
            job_runner
                .handle
                .await
                .map_err(|e| OrchestratorError::ShutdownError(e.to_string()))?;
        }

        // 2. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
