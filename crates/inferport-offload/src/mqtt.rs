use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{PubSubTransport, TransportEvent};

/// Largest packet sent or accepted; room for a base64 image plus envelope.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Applies to both directions. Larger publishes fail the session.
    pub max_packet_size: usize,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

/// MQTT 3.1.1 session: clean session, QoS 1, non-retained publishes.
pub struct MqttTransport {
    config: MqttConfig,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.session.lock().as_ref().map(|s| s.client.clone())
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("mqtt connect failed")? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("broker refused connection: {:?}", ack.code);
                }
                return Ok(());
            }
            other => debug!(event = ?other, "mqtt event before connack"),
        }
    }
}

async fn pump(mut eventloop: EventLoop, tx: mpsc::Sender<TransportEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let event = TransportEvent::Message {
                    topic: p.topic,
                    payload: p.payload,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt connection lost");
                let _ = tx.send(TransportEvent::ConnectionLost(err.to_string())).await;
                break;
            }
        }
    }
}

#[async_trait]
impl PubSubTransport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self, inbound_topic: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut opts = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        opts.set_keep_alive(self.config.keep_alive);
        opts.set_clean_session(true);
        opts.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        tokio::time::timeout(self.config.connect_timeout, await_connack(&mut eventloop))
            .await
            .with_context(|| {
                format!(
                    "timed out connecting to {}:{}",
                    self.config.host, self.config.port
                )
            })??;

        client
            .subscribe(inbound_topic, QoS::AtLeastOnce)
            .await
            .context("failed to subscribe to response topic")?;

        let (tx, rx) = mpsc::channel(256);
        let pump = tokio::spawn(pump(eventloop, tx));

        if let Some(old) = self.session.lock().replace(Session { client, pump }) {
            old.pump.abort();
        }
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let Some(client) = self.current_client() else {
            bail!("mqtt transport is not connected");
        };
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .context("mqtt publish failed")
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let result = session.client.disconnect().await;
        session.pump.abort();
        result.context("mqtt disconnect failed")
    }
}
