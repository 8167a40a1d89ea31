//! Request/response on top of fire-and-forget publish/subscribe.
//!
//! Every submission registers a oneshot slot under a fresh correlation id
//! before its request is published. A single dispatcher task per session
//! reads the response topic and completes whichever slot the response names.
//! The slot is removed by whichever of response, timeout, connection loss or
//! disconnect gets to it first; the others find it gone and do nothing.
//! Connection loss fails only the slots published on the lost session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use inferport_core::{ExecError, ExecMode, ResultEnvelope, Timings};
use inferport_proto::{
    new_request_id, response_topic, OffloadRequest, OffloadResponse, REQUESTS_TOPIC,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{PubSubTransport, TransportEvent};

/// Upper bound applied to every caller-supplied offload timeout.
pub const MAX_OFFLOAD_TIMEOUT: Duration = Duration::from_secs(60);

type PendingMap = DashMap<String, Pending>;

/// A submission waiting for its response, tagged with the session it was
/// published on.
struct Pending {
    session: u64,
    tx: oneshot::Sender<Result<OffloadResponse, ExecError>>,
}

#[derive(Clone, Debug)]
pub struct OffloadTask {
    pub image: Bytes,
    pub model_name: String,
}

pub struct OffloadClient {
    client_id: String,
    transport: Arc<dyn PubSubTransport>,
    pending: Arc<PendingMap>,
    link: Arc<Link>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Connection flag tagged with the session it belongs to, so a dispatcher
/// from an older session cannot mark a newer one as lost.
#[derive(Default)]
struct Link {
    connected: AtomicBool,
    session: AtomicU64,
}

impl Link {
    fn open(&self) -> u64 {
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        self.connected.store(true, Ordering::Release);
        session
    }

    fn close(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
    }

    fn lost(&self, session: u64) -> bool {
        if self.session.load(Ordering::Acquire) == session {
            self.connected.store(false, Ordering::Release);
            return true;
        }
        false
    }

    fn is_up(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The live session, if connected.
    fn current(&self) -> Option<u64> {
        let session = self.session.load(Ordering::Acquire);
        self.is_up().then_some(session)
    }
}

/// Removes the pending slot however the submission ends, including when the
/// caller drops the future.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    request_id: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

impl OffloadClient {
    pub fn new(client_id: impl Into<String>, transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            client_id: client_id.into(),
            transport,
            pending: Arc::new(DashMap::new()),
            link: Arc::new(Link::default()),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Subscribes to this client's response topic. No-op while connected.
    pub async fn connect(&self) -> Result<(), ExecError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if self.link.is_up() {
            return Ok(());
        }
        if let Some(stale) = dispatcher.take() {
            stale.abort();
        }

        let topic = response_topic(&self.client_id);
        let inbound = self
            .transport
            .connect(&topic)
            .await
            .map_err(ExecError::connectivity)?;

        let session = self.link.open();
        *dispatcher = Some(tokio::spawn(dispatch(
            inbound,
            self.pending.clone(),
            self.link.clone(),
            session,
            self.client_id.clone(),
        )));
        info!(
            client_id = %self.client_id,
            transport = self.transport.name(),
            %topic,
            "offload client connected"
        );
        Ok(())
    }

    /// Closes the session and cancels every outstanding submission.
    pub async fn disconnect(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        self.link.close();
        if let Some(task) = dispatcher.take() {
            task.abort();
        }
        if let Err(err) = self.transport.disconnect().await {
            warn!(error = %err, "transport disconnect failed");
        }

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let cancelled = ids
            .iter()
            .filter(|id| self.pending.remove(id.as_str()).is_some())
            .count();
        info!(client_id = %self.client_id, cancelled, "offload client disconnected");
    }

    /// Publishes one request and waits for its response, at most `timeout`
    /// (capped at [`MAX_OFFLOAD_TIMEOUT`]).
    pub async fn submit(
        &self,
        task: &OffloadTask,
        timeout: Duration,
    ) -> Result<OffloadResponse, ExecError> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let timeout = timeout.min(MAX_OFFLOAD_TIMEOUT);
        let session = self
            .link
            .current()
            .ok_or_else(|| ExecError::Connectivity("offload session closed".to_string()))?;

        let request_id = new_request_id();
        let request =
            OffloadRequest::image(&self.client_id, &request_id, &task.image, &task.model_name);
        let payload = request
            .encode()
            .map_err(|e| ExecError::InvalidInput(format!("{e:#}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), Pending { session, tx });
        let _slot = PendingSlot {
            pending: &self.pending,
            request_id: &request_id,
        };
        // A loss reported before the insert would not have seen this slot.
        if self.link.current() != Some(session) {
            return Err(ExecError::Connectivity(
                "offload connection lost before publish".to_string(),
            ));
        }

        let started = Instant::now();
        if let Err(err) = self.transport.publish(REQUESTS_TOPIC, payload).await {
            self.link.close();
            return Err(ExecError::connectivity(err));
        }
        debug!(
            %request_id,
            model = %task.model_name,
            bytes = task.image.len(),
            "offload request published"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(resp))) if resp.ok => Ok(resp),
            Ok(Ok(Ok(resp))) => Err(ExecError::Remote {
                request_id: request_id.clone(),
                error: resp.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            Ok(Ok(Err(err))) => {
                warn!(%request_id, error = %err, "offload request failed in flight");
                Err(err)
            }
            Ok(Err(_)) => Err(ExecError::Cancelled {
                request_id: request_id.clone(),
            }),
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(%request_id, ?elapsed, "offload request timed out");
                Err(ExecError::Timeout {
                    request_id: request_id.clone(),
                    elapsed,
                })
            }
        }
    }

    /// [`submit`](Self::submit) shaped into a result envelope.
    pub async fn submit_task(
        &self,
        task: &OffloadTask,
        top_k: usize,
        timeout: Duration,
    ) -> Result<ResultEnvelope, ExecError> {
        let started = Instant::now();
        let resp = self.submit(task, timeout).await?;
        let round_trip = started.elapsed();

        let ranking = resp.ranking(top_k);
        let mut timing_ms = Timings(resp.timing_ms);
        if let Some(remote_total) = timing_ms.0.remove(Timings::TOTAL) {
            timing_ms.0.insert("remote_total".to_string(), remote_total);
        }
        timing_ms.set("round_trip", round_trip);
        timing_ms.set(Timings::TOTAL, round_trip);

        Ok(ResultEnvelope {
            model: resp.model.unwrap_or_else(|| task.model_name.clone()),
            backend: ExecMode::Offload,
            requested: ExecMode::Offload,
            ranking,
            timing_ms,
        })
    }

    /// Routes one inbound payload to its pending slot. Returns whether a slot
    /// was completed; malformed, unknown and duplicate responses are dropped.
    pub fn handle_inbound(&self, payload: &[u8]) -> bool {
        resolve(&self.pending, &self.client_id, payload)
    }
}

impl Drop for OffloadClient {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

async fn dispatch(
    mut inbound: mpsc::Receiver<TransportEvent>,
    pending: Arc<PendingMap>,
    link: Arc<Link>,
    session: u64,
    client_id: String,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Message { payload, .. } => {
                resolve(&pending, &client_id, &payload);
            }
            TransportEvent::ConnectionLost(reason) => {
                if link.lost(session) {
                    warn!(%client_id, %reason, "offload connection lost; will reconnect on next submit");
                }
                fail_session(&pending, session, &reason);
                return;
            }
        }
    }
    link.lost(session);
    fail_session(&pending, session, "transport session ended");
}

/// Fails every submission published on `session` with a connectivity error.
fn fail_session(pending: &PendingMap, session: u64, reason: &str) {
    let ids: Vec<String> = pending
        .iter()
        .filter(|e| e.value().session == session)
        .map(|e| e.key().clone())
        .collect();
    for id in ids {
        if let Some((_, slot)) = pending.remove(&id) {
            let err = ExecError::Connectivity(format!("connection lost: {reason}"));
            let _ = slot.tx.send(Err(err));
        }
    }
}

fn resolve(pending: &PendingMap, client_id: &str, payload: &[u8]) -> bool {
    let resp = match OffloadResponse::decode(payload) {
        Ok(resp) => resp,
        Err(err) => {
            debug!(error = %err, "dropping malformed offload response");
            return false;
        }
    };
    let Some(request_id) = resp.correlation_id().map(str::to_string) else {
        debug!("dropping offload response without request_id");
        return false;
    };
    if resp.client_id.as_deref().is_some_and(|id| id != client_id) {
        debug!(%request_id, "dropping offload response addressed to another client");
        return false;
    }

    match pending.remove(&request_id) {
        Some((_, slot)) => {
            if slot.tx.send(Ok(resp)).is_err() {
                debug!(%request_id, "submitter gone before response arrived");
            }
            true
        }
        None => {
            debug!(%request_id, "no pending request; dropping late or duplicate response");
            false
        }
    }
}
