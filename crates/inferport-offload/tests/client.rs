use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use inferport_core::{ExecError, ExecMode, Ranked};
use inferport_offload::{MemoryBroker, OffloadClient, OffloadTask, TransportEvent};
use inferport_proto::{response_topic, OffloadRequest, OffloadResponse, REQUESTS_TOPIC};
use tokio::task::JoinHandle;

const CLIENT: &str = "device-test0001";

fn task() -> OffloadTask {
    OffloadTask {
        image: Bytes::from_static(b"\xff\xd8fake-jpeg"),
        model_name: "mv3".to_string(),
    }
}

fn client(broker: &MemoryBroker) -> OffloadClient {
    OffloadClient::new(CLIENT, Arc::new(broker.transport()))
}

/// Remote worker that answers every request `copies` times.
fn spawn_worker(broker: &MemoryBroker, copies: usize) -> JoinHandle<()> {
    let broker = broker.clone();
    let mut requests = broker.subscribe(REQUESTS_TOPIC);
    tokio::spawn(async move {
        while let Some(TransportEvent::Message { payload, .. }) = requests.recv().await {
            let Ok(req) = OffloadRequest::decode(&payload) else {
                continue;
            };
            let top5 = (0..5)
                .map(|i| Ranked {
                    label: format!("remote-{i}"),
                    prob: 0.9 - i as f32 * 0.1,
                })
                .collect();
            let mut timing = BTreeMap::new();
            timing.insert("infer".to_string(), 4.0);
            timing.insert("total".to_string(), 6.0);
            let Ok(raw) = OffloadResponse::success(&req, top5, timing).encode() else {
                continue;
            };
            for _ in 0..copies {
                broker.publish(&response_topic(&req.client_id), raw.clone()).await;
            }
        }
    })
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() > deadline {
            bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn response_resolves_matching_request() -> Result<()> {
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, 1);
    let client = client(&broker);

    let env = client
        .submit_task(&task(), 3, Duration::from_secs(2))
        .await?;

    assert_eq!(env.backend, ExecMode::Offload);
    assert_eq!(env.model, "mv3");
    assert_eq!(env.ranking.len(), 3);
    assert_eq!(env.ranking[0].label, "remote-0");
    assert!(env.timing_ms.get("round_trip").is_some());
    assert_eq!(env.timing_ms.get("remote_total"), Some(6.0));
    assert_eq!(client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn silent_broker_times_out_and_frees_slot() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let started = Instant::now();
    let err = client
        .submit(&task(), Duration::from_millis(100))
        .await
        .err()
        .context("expected a timeout")?;
    let waited = started.elapsed();

    let ExecError::Timeout {
        request_id,
        elapsed,
    } = &err
    else {
        bail!("expected timeout, got {err}");
    };
    assert!(err.is_timeout());
    assert!(*elapsed >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(1));
    assert!(!client.is_pending(request_id));
    assert_eq!(client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let err = client
        .submit(&task(), Duration::from_millis(20))
        .await
        .err()
        .context("expected a timeout")?;
    let request_id = err.request_id().context("timeout carries its id")?.to_string();

    let late = OffloadResponse {
        ok: true,
        request_id: Some(request_id.clone()),
        ..Default::default()
    }
    .encode()?;
    assert!(!client.handle_inbound(&late));

    // Delivered through the broker as well, the dispatcher drops it.
    broker.publish(&response_topic(CLIENT), late).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_len(), 0);
    assert!(client.is_connected());
    Ok(())
}

#[tokio::test]
async fn duplicate_delivery_resolves_once() -> Result<()> {
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, 3);
    let client = client(&broker);

    for _ in 0..3 {
        let resp = client.submit(&task(), Duration::from_secs(2)).await?;
        assert!(resp.ok);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_responses_are_ignored() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker));
    client.connect().await?;

    let submitter = {
        let client = client.clone();
        tokio::spawn(async move { client.submit(&task(), Duration::from_secs(2)).await })
    };
    wait_for(|| client.pending_len() == 1).await?;

    let topic = response_topic(CLIENT);
    broker.publish(&topic, Bytes::from_static(b"{not json")).await;
    broker.publish(&topic, Bytes::from_static(br#"{"ok":true}"#)).await;
    broker
        .publish(&topic, Bytes::from_static(br#"{"ok":true,"request_id":"nobody"}"#))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_len(), 1);

    assert!(!submitter.is_finished());
    client.disconnect().await;
    let err = submitter.await?.err().context("expected cancellation")?;
    assert!(matches!(err, ExecError::Cancelled { .. }));
    Ok(())
}

#[tokio::test]
async fn disconnect_cancels_every_pending_request() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker));

    let submitters: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.submit(&task(), Duration::from_secs(30)).await })
        })
        .collect();
    wait_for(|| client.pending_len() == 3).await?;

    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(client.pending_len(), 0);

    for s in submitters {
        let err = s.await?.err().context("expected cancellation")?;
        assert!(matches!(err, ExecError::Cancelled { .. }), "got {err}");
    }
    Ok(())
}

#[tokio::test]
async fn connect_is_idempotent() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    client.connect().await?;
    client.connect().await?;
    assert!(client.is_connected());
    assert_eq!(broker.subscriber_count(&response_topic(CLIENT)), 1);
    Ok(())
}

#[tokio::test]
async fn reconnects_after_connection_loss() -> Result<()> {
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, 1);
    let client = client(&broker);

    client.connect().await?;
    broker.sever(&response_topic(CLIENT), "keepalive expired");
    wait_for(|| !client.is_connected()).await?;

    let resp = client.submit(&task(), Duration::from_secs(2)).await?;
    assert!(resp.ok);
    assert!(client.is_connected());
    assert_eq!(broker.subscriber_count(&response_topic(CLIENT)), 1);
    Ok(())
}

#[tokio::test]
async fn transport_failures_surface_immediately() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    broker.set_online(false);
    let err = client
        .submit(&task(), Duration::from_secs(30))
        .await
        .err()
        .context("connect should fail")?;
    assert!(matches!(err, ExecError::Connectivity(_)), "got {err}");

    broker.set_online(true);
    client.connect().await?;
    broker.set_online(false);

    let started = Instant::now();
    let err = client
        .submit(&task(), Duration::from_secs(30))
        .await
        .err()
        .context("publish should fail")?;
    assert!(matches!(err, ExecError::Connectivity(_)), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn remote_rejection_is_typed() -> Result<()> {
    let broker = MemoryBroker::new();
    let mut requests = broker.subscribe(REQUESTS_TOPIC);
    let responder = {
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Some(TransportEvent::Message { payload, .. }) = requests.recv().await {
                if let Ok(req) = OffloadRequest::decode(&payload) {
                    if let Ok(raw) =
                        OffloadResponse::failure(&req.request_id, "model not loaded").encode()
                    {
                        broker.publish(&response_topic(&req.client_id), raw).await;
                    }
                }
            }
        })
    };

    let client = client(&broker);
    let err = client
        .submit(&task(), Duration::from_secs(2))
        .await
        .err()
        .context("expected rejection")?;
    responder.await?;

    let ExecError::Remote { error, .. } = err else {
        bail!("expected remote rejection, got {err}");
    };
    assert_eq!(error, "model not loaded");
    assert_eq!(client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn connection_loss_fails_in_flight_requests_fast() -> Result<()> {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker));
    client.connect().await?;

    let started = Instant::now();
    let submitter = {
        let client = client.clone();
        tokio::spawn(async move { client.submit(&task(), Duration::from_secs(30)).await })
    };
    wait_for(|| client.pending_len() == 1).await?;

    broker.sever(&response_topic(CLIENT), "packet too large");
    let err = submitter.await?.err().context("expected a connectivity failure")?;
    assert!(matches!(err, ExecError::Connectivity(_)), "got {err}");
    assert!(err.to_string().contains("packet too large"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pending_len(), 0);
    assert!(!client.is_connected());
    Ok(())
}
