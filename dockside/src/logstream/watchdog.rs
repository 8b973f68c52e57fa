//! Log stream watchdog
//!
//! Streams the output of every instance of a resource through the run-log
//! topic to a callback. The engine stream blocks while healthy; when it ends
//! and the resource is still running, every instance is reopened from the
//! timestamp of the last line delivered for that instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::topics::Topics;
use crate::bus::{self, PubSub, Subscription};
use crate::deploy::lifecycle::ContainerLifecycleManager;
use crate::engine::LogLine;
use crate::errors::OrchestratorError;
use crate::models::resource::{Resource, RunStatus};

/// Watchdog options
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    /// Topic namespace
    pub namespace: String,

    /// Liveness check period
    pub tick: Duration,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            namespace: "dockside".to_string(),
            tick: Duration::from_secs(3),
        }
    }
}

/// Timestamp of the last delivered line, per container
type Checkpoints = HashMap<String, DateTime<Utc>>;

/// How one streaming round ended
enum Round {
    Cancelled,
    Restart(Checkpoints),
}

/// Delivers a line unless it is not newer than its container's checkpoint.
/// Instances interleave in the shared sink, so ordering only holds within
/// one container.
struct Delivery<'a, F> {
    checkpoints: Checkpoints,
    on_line: &'a mut F,
}

impl<F: FnMut(LogLine)> Delivery<'_, F> {
    fn deliver(&mut self, payload: &[u8]) {
        let line: LogLine = match serde_json::from_slice(payload) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping malformed log payload: {}", e);
                return;
            }
        };
        if self
            .checkpoints
            .get(&line.container)
            .is_some_and(|cp| line.timestamp <= *cp)
        {
            return;
        }
        self.checkpoints
            .insert(line.container.clone(), line.timestamp);
        (self.on_line)(line);
    }

    fn drain(&mut self, subscription: &mut Subscription) {
        while let Some(Some(payload)) = subscription.next().now_or_never() {
            self.deliver(&payload);
        }
    }
}

/// Supervises the log stream of resources
pub struct LogStreamWatchdog {
    lifecycle: Arc<ContainerLifecycleManager>,
    bus: Arc<dyn PubSub>,
    options: WatchdogOptions,
}

impl LogStreamWatchdog {
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        bus: Arc<dyn PubSub>,
        options: WatchdogOptions,
    ) -> Self {
        Self {
            lifecycle,
            bus,
            options,
        }
    }

    /// Deliver the log lines of `resource` to `on_line` until `cancel` fires
    pub async fn stream<F>(
        &self,
        resource: &Resource,
        cancel: CancellationToken,
        mut on_line: F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnMut(LogLine) + Send,
    {
        info!("Streaming logs of resource {}", resource.id);
        let mut checkpoints = Checkpoints::new();
        loop {
            match self.round(resource, &cancel, checkpoints, &mut on_line).await? {
                Round::Cancelled => {
                    debug!("Log stream of {} cancelled", resource.id);
                    return Ok(());
                }
                Round::Restart(last) => {
                    debug!("Restarting log stream of {} from {:?}", resource.id, last);
                    checkpoints = last;
                }
            }
        }
    }

    async fn round<F>(
        &self,
        resource: &Resource,
        cancel: &CancellationToken,
        checkpoints: Checkpoints,
        on_line: &mut F,
    ) -> Result<Round, OrchestratorError>
    where
        F: FnMut(LogLine) + Send,
    {
        // closes the writer/subscriber pair when this round ends
        let session = cancel.child_token();
        let _session_guard = session.clone().drop_guard();

        let topic = Topics::run_logs(&self.options.namespace, &resource.id);
        let (writer, mut subscription) =
            bus::ephemeral(self.bus.clone(), &topic, session.clone()).await?;

        let streaming = {
            let lifecycle = self.lifecycle.clone();
            let resource = resource.clone();
            let session = session.clone();
            let since = checkpoints.clone();
            tokio::spawn(async move {
                lifecycle
                    .stream_logs(&resource, &since, Arc::new(writer), session)
                    .await
            })
        };
        let abort = streaming.abort_handle();

        let mut delivery = Delivery {
            checkpoints,
            on_line,
        };
        let mut ticker = interval_at(Instant::now() + self.options.tick, self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscribed = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    abort.abort();
                    return Ok(Round::Cancelled);
                }
                payload = subscription.next(), if subscribed => match payload {
                    Some(payload) => delivery.deliver(&payload),
                    None => subscribed = false,
                },
                _ = ticker.tick() => {
                    if !streaming.is_finished() {
                        continue;
                    }
                    match self.lifecycle.run_status(resource).await {
                        RunStatus::Running => {
                            delivery.drain(&mut subscription);
                            return Ok(Round::Restart(delivery.checkpoints));
                        }
                        status => debug!(
                            "Log stream of {} stopped, resource is {:?}, waiting",
                            resource.id, status
                        ),
                    }
                }
            }
        }
    }
}
