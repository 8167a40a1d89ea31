//! Worker side of the offload protocol, served in-process. Used with the
//! memory transport so `offload` mode works with no network broker. The
//! worker owns its manager; the device's manager is never handed to it.

use std::sync::Arc;

use inferport_core::{AccelStrategy, Backend, ModelDescriptor};
use inferport_offload::{MemoryBroker, TransportEvent};
use inferport_proto::{response_topic, OffloadRequest, OffloadResponse, REQUESTS_TOPIC};
use inferport_runtime::LocalBackendManager;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const WORKER_TOP_K: usize = 5;

pub fn spawn_loopback_worker<B: Backend>(
    broker: MemoryBroker,
    manager: Arc<LocalBackendManager<B>>,
) -> JoinHandle<()> {
    let mut requests = broker.subscribe(REQUESTS_TOPIC);
    tokio::spawn(async move {
        while let Some(event) = requests.recv().await {
            let TransportEvent::Message { payload, .. } = event else {
                break;
            };
            let req = match OffloadRequest::decode(&payload) {
                Ok(req) => req,
                Err(err) => {
                    debug!(error = %err, "loopback worker dropping malformed request");
                    continue;
                }
            };

            let resp = serve(&manager, &req).await;
            match resp.encode() {
                Ok(raw) => {
                    broker.publish(&response_topic(&req.client_id), raw).await;
                }
                Err(err) => warn!(error = %err, "loopback worker failed to encode response"),
            }
        }
    })
}

async fn serve<B: Backend>(
    manager: &Arc<LocalBackendManager<B>>,
    req: &OffloadRequest,
) -> OffloadResponse {
    let image = match req.image_bytes() {
        Ok(image) => image,
        Err(err) => return OffloadResponse::failure(&req.request_id, format!("{err:#}")),
    };
    let model = ModelDescriptor::from_name(&req.model_name);
    let manager = manager.clone();
    let result = tokio::task::spawn_blocking(move || {
        manager.run_with_model(model, &image, WORKER_TOP_K, AccelStrategy::Cpu)
    })
    .await;

    match result {
        Ok(Ok(env)) => {
            let mut resp = OffloadResponse::success(req, env.ranking, env.timing_ms.0);
            resp.model = Some(env.model);
            resp
        }
        Ok(Err(err)) => OffloadResponse::failure(&req.request_id, err.to_string()),
        Err(err) => OffloadResponse::failure(&req.request_id, format!("worker task failed: {err}")),
    }
}
