use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message { topic: String, payload: Bytes },
    /// The session is gone; nothing more arrives on this receiver.
    ConnectionLost(String),
}

/// Fire-and-forget publish/subscribe session with a broker.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Opens a session subscribed to `inbound_topic`. Replaces any previous
    /// session.
    async fn connect(&self, inbound_topic: &str) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
