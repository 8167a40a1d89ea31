mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{FakeBackend, FakePreprocessor};
use inferport_core::{ExecError, ExecMode, Labels, ModelDescriptor, Ranked};
use inferport_offload::{MemoryBroker, OffloadClient, TransportEvent};
use inferport_proto::{response_topic, OffloadRequest, OffloadResponse, REQUESTS_TOPIC};
use inferport_runtime::{ExecutionRouter, LocalBackendManager, ManagerConfig, Task};

const IMAGE: &[u8] = b"jpeg-bytes";

fn local_router() -> ExecutionRouter<FakeBackend> {
    let manager = LocalBackendManager::new(
        FakeBackend::new(20).with_caps(true, false),
        FakePreprocessor::default(),
        Labels::default(),
        ManagerConfig::default(),
    );
    ExecutionRouter::new(Arc::new(manager))
}

/// Answers every offload request with a ranking naming the requested model.
fn spawn_worker(broker: &MemoryBroker) {
    let broker = broker.clone();
    let mut requests = broker.subscribe(REQUESTS_TOPIC);
    tokio::spawn(async move {
        while let Some(TransportEvent::Message { payload, .. }) = requests.recv().await {
            let Ok(req) = OffloadRequest::decode(&payload) else {
                continue;
            };
            let top5 = vec![
                Ranked {
                    label: format!("{}-best", req.model_name),
                    prob: 0.8,
                },
                Ranked {
                    label: "runner-up".to_string(),
                    prob: 0.1,
                },
            ];
            let mut timing = BTreeMap::new();
            timing.insert("infer".to_string(), 3.0);
            if let Ok(raw) = OffloadResponse::success(&req, top5, timing).encode() {
                broker.publish(&response_topic(&req.client_id), raw).await;
            }
        }
    });
}

fn offload_router(broker: &MemoryBroker) -> ExecutionRouter<FakeBackend> {
    let client = OffloadClient::new("device-router", Arc::new(broker.transport()));
    local_router().with_offload(Arc::new(client), Duration::from_secs(2))
}

#[tokio::test(flavor = "multi_thread")]
async fn local_modes_switch_model_first() -> Result<()> {
    let router = local_router();

    let task = Task::new(IMAGE, ModelDescriptor::EFF0, 3);
    let env = router.run(ExecMode::Gpu, task).await?;

    assert_eq!(env.model, "eff0");
    assert_eq!(env.backend, ExecMode::Gpu);
    assert_eq!(env.ranking.len(), 3);
    assert_eq!(router.manager().current_model(), ModelDescriptor::EFF0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn offload_mode_goes_through_the_broker() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_worker(&broker);
    let router = offload_router(&broker);

    let task = Task::new(IMAGE, ModelDescriptor::EFF0, 1);
    let env = router.run(ExecMode::Offload, task).await?;

    assert_eq!(env.backend, ExecMode::Offload);
    assert_eq!(env.ranking.len(), 1);
    assert_eq!(env.ranking[0].label, "eff0-best");
    assert!(env.timing_ms.get("round_trip").is_some());
    // Offloading leaves the local backend alone.
    assert!(router.manager().live_backend().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn offload_without_client_is_a_connectivity_error() {
    let router = local_router();
    let err = router
        .run(ExecMode::Offload, Task::new(IMAGE, ModelDescriptor::MV3, 1))
        .await
        .err();
    assert!(matches!(err, Some(ExecError::Connectivity(_))), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn hint_overrides_router_default() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_worker(&broker);
    let router = offload_router(&broker).with_default_mode(ExecMode::Offload);

    let remote = router
        .run_task(Task::new(IMAGE, ModelDescriptor::MV3, 2))
        .await?;
    assert_eq!(remote.backend, ExecMode::Offload);

    let local = router
        .run_task(Task::new(IMAGE, ModelDescriptor::MV3, 2).with_mode(ExecMode::Cpu))
        .await?;
    assert_eq!(local.backend, ExecMode::Cpu);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_results_follow_task_order() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_worker(&broker);
    let router = offload_router(&broker);

    let tasks = vec![
        Task::new(IMAGE, ModelDescriptor::MV3, 2).with_mode(ExecMode::Cpu),
        Task::new(IMAGE, ModelDescriptor::EFF0, 2).with_mode(ExecMode::Offload),
        Task::new(IMAGE, ModelDescriptor::EFF0, 2).with_mode(ExecMode::Accelerator),
        Task::new(IMAGE, ModelDescriptor::MV3, 2).with_mode(ExecMode::Offload),
    ];
    let results = router.run_batch(tasks).await;
    assert_eq!(results.len(), 4);

    let modes: Vec<ExecMode> = results
        .iter()
        .map(|r| r.as_ref().map(|env| env.backend))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    // The accelerator task falls back to CPU on this backend.
    assert_eq!(
        modes,
        [ExecMode::Cpu, ExecMode::Offload, ExecMode::Cpu, ExecMode::Offload]
    );

    let remote = results[1].as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(remote.top1().context("empty ranking")?.label, "eff0-best");
    let client = router.offload().context("offload configured")?;
    assert_eq!(client.pending_len(), 0);
    Ok(())
}
