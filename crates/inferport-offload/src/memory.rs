use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{PubSubTransport, TransportEvent};

const SUBSCRIBER_CAPACITY: usize = 256;

/// In-process broker. Loopback deployments and tests use it in place of a
/// network broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<TransportEvent>>>>,
    online: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
            }),
        }
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Delivers to every live subscriber of `topic` and returns how many got it.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let subscribers = self
            .inner
            .topics
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for sub in subscribers {
            let event = TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sub.send(event).await.is_ok() {
                delivered += 1;
            }
        }
        self.prune(topic);
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.prune(topic);
        self.inner.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// While offline, connects and publishes fail.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Drops every subscription on `topic`, telling each subscriber its
    /// connection was lost.
    pub fn sever(&self, topic: &str, reason: &str) {
        let subscribers = self.inner.topics.lock().remove(topic).unwrap_or_default();
        for sub in subscribers {
            let _ = sub.try_send(TransportEvent::ConnectionLost(reason.to_string()));
        }
    }

    fn prune(&self, topic: &str) {
        if let Some(subs) = self.inner.topics.lock().get_mut(topic) {
            subs.retain(|s| !s.is_closed());
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, inbound_topic: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        if !self.broker.is_online() {
            bail!("memory broker is offline");
        }
        Ok(self.broker.subscribe(inbound_topic))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.broker.is_online() {
            bail!("memory broker is offline");
        }
        self.broker.publish(topic, payload).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
