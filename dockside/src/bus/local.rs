//! In-process pub/sub bus

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

use crate::bus::{PubSub, Subscription};
use crate::errors::OrchestratorError;

const CHANNEL_CAPACITY: usize = 1024;

/// Pub/sub bus backed by one broadcast channel per topic
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), OrchestratorError> {
        // no receivers is not an error
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, OrchestratorError> {
        let rx = self.sender(topic).subscribe();
        let name = topic.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, {} messages skipped", name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Subscription::new(topic, stream.boxed()))
    }
}
