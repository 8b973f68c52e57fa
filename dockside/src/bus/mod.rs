//! Pub/sub transport for log lines
//!
//! Topics carry JSON payloads. The watchdog uses an ephemeral writer /
//! subscriber pair: the writer is handed to the container engine as a log
//! sink, the subscriber delivers whatever the writer published, and both are
//! closed when their cancellation token fires.

pub mod local;
pub mod mqtt;
pub mod topics;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{EngineError, LogLine, LogSink};
use crate::errors::OrchestratorError;

/// Stream of payloads published on one topic
pub struct Subscription {
    topic: String,
    stream: BoxStream<'static, Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, stream: BoxStream<'static, Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            stream,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.stream.next().await
    }

    /// Close the subscription when `cancel` fires
    pub fn until_cancelled(self, cancel: CancellationToken) -> Self {
        Self {
            topic: self.topic,
            stream: self.stream.take_until(cancel.cancelled_owned()).boxed(),
        }
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), OrchestratorError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, OrchestratorError>;
}

/// Writes container log lines to a topic
pub struct TopicWriter {
    bus: Arc<dyn PubSub>,
    topic: String,
    cancel: CancellationToken,
}

impl TopicWriter {
    pub fn new(bus: Arc<dyn PubSub>, topic: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            bus,
            topic: topic.into(),
            cancel,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl LogSink for TopicWriter {
    async fn write(&self, line: LogLine) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Other(format!("writer for {} is closed", self.topic)));
        }
        let payload = serde_json::to_vec(&line).map_err(|e| EngineError::Other(e.to_string()))?;
        self.bus
            .publish(&self.topic, payload)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))
    }
}

/// Open a writer and a subscriber on `topic`, both closed when `cancel` fires.
///
/// The subscriber is registered before the writer is returned so nothing the
/// writer publishes is missed.
pub async fn ephemeral(
    bus: Arc<dyn PubSub>,
    topic: &str,
    cancel: CancellationToken,
) -> Result<(TopicWriter, Subscription), OrchestratorError> {
    let subscription = bus.subscribe(topic).await?.until_cancelled(cancel.clone());
    debug!("Opened ephemeral writer/subscriber on {}", topic);
    Ok((TopicWriter::new(bus, topic, cancel), subscription))
}
