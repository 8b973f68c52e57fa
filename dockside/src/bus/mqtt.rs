//! MQTT pub/sub bus

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{PubSub, Subscription};
use crate::errors::OrchestratorError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>;

/// Pub/sub bus on an MQTT broker
pub struct MqttBus {
    client: AsyncClient,
    subscribers: Subscribers,
}

fn transport_err(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Transport(e.to_string())
}

/// TLS transport verifying the broker against `ca_cert_path`, or the
/// system store when unset
fn tls_transport(address: &MqttAddress) -> anyhow::Result<rumqttc::Transport> {
    use rumqttc::{TlsConfiguration, Transport};
    use rustls::ClientConfig;

    let mut root_cert_store = rustls::RootCertStore::empty();

    if let Some(ref ca_path) = address.ca_cert_path {
        let ca_pem = std::fs::read(ca_path)
            .with_context(|| format!("failed to read CA certificate {ca_path}"))?;
        let mut cursor = std::io::Cursor::new(ca_pem);
        for cert in rustls_pemfile::certs(&mut cursor) {
            let cert = cert.with_context(|| format!("invalid PEM in {ca_path}"))?;
            root_cert_store
                .add(cert)
                .with_context(|| format!("rejected CA certificate in {ca_path}"))?;
        }
        if root_cert_store.is_empty() {
            bail!("no CA certificate found in {ca_path}");
        }
    } else {
        let certs =
            rustls_native_certs::load_native_certs().context("failed to load system certificates")?;
        for cert in certs {
            let _ = root_cert_store.add(cert);
        }
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(client_config),
    )))
}

impl MqttBus {
    /// Connect to the broker. The event loop runs in the background until
    /// `cancel` fires.
    pub fn connect(
        address: &MqttAddress,
        client_id: &str,
        backoff: CooldownOptions,
        cancel: CancellationToken,
    ) -> Result<Self, OrchestratorError> {
        if address.host.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "MQTT host is not configured".to_string(),
            ));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&address.username, &address.password) {
            options.set_credentials(user, pass);
        }
        if address.use_tls {
            options.set_transport(tls_transport(address)?);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        info!(
            "Connecting to MQTT broker: {}:{}",
            address.host, address.port
        );
        tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            subscribers.clone(),
            backoff,
            cancel,
        ));

        Ok(Self {
            client,
            subscribers,
        })
    }
}

fn dispatch(subscribers: &Subscribers, topic: &str, payload: &[u8]) {
    let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(senders) = subscribers.get_mut(topic) {
        senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
    }
}

/// Drop the closed senders of `topic`. Returns whether the topic was left
/// without subscribers, in which case its entry is removed.
fn release(subscribers: &Subscribers, topic: &str) -> bool {
    let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
    let empty = match subscribers.get_mut(topic) {
        Some(senders) => {
            senders.retain(|tx| !tx.is_closed());
            senders.is_empty()
        }
        None => false,
    };
    if empty {
        subscribers.remove(topic);
    }
    empty
}

/// Receiving end of one local subscription. The broker subscription is
/// dropped with the last receiver of its topic.
struct TopicReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    topic: String,
    client: AsyncClient,
    subscribers: Subscribers,
}

impl Drop for TopicReceiver {
    fn drop(&mut self) {
        self.rx.close();
        if !release(&self.subscribers, &self.topic) {
            return;
        }
        match self.client.try_unsubscribe(self.topic.clone()) {
            Ok(()) => info!("Unsubscribed from: {}", self.topic),
            Err(e) => debug!("Failed to unsubscribe from {}: {}", self.topic, e),
        }
    }
}

fn subscribed_topics(subscribers: &Subscribers) -> Vec<String> {
    let subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
    subscribers.keys().cloned().collect()
}

async fn poll_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscribers: Subscribers,
    backoff: CooldownOptions,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic: {}", publish.topic);
                dispatch(&subscribers, &publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                failures = 0;
                // session state is not kept by the broker, subscribe again
                for topic in subscribed_topics(&subscribers) {
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        warn!("Failed to resubscribe to {}: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                let delay = calc_exp_backoff(&backoff, failures);
                failures = failures.saturating_add(1);
                warn!("MQTT poll error: {}, retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        debug!("MQTT disconnect failed: {}", e);
    }
    info!("MQTT disconnected");
}

#[async_trait]
impl PubSub for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), OrchestratorError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(transport_err)?;
        debug!("Published to: {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, OrchestratorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let senders = subscribers.entry(topic.to_string()).or_default();
            senders.push(tx);
            senders.len() == 1
        };

        if first {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(transport_err)?;
            info!("Subscribed to: {}", topic);
        }

        let receiver = TopicReceiver {
            rx,
            topic: topic.to_string(),
            client: self.client.clone(),
            subscribers: self.subscribers.clone(),
        };
        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .rx
                .recv()
                .await
                .map(|payload| (payload, receiver))
        });
        Ok(Subscription::new(topic, stream.boxed()))
    }
}
