pub mod config;
pub mod http;
pub mod loopback;
pub mod schedule;

use std::sync::Arc;

use anyhow::Result;
use inferport_core::{Backend, ExecMode, Labels};
use inferport_offload::{MemoryBroker, OffloadClient, PubSubTransport};
use inferport_proto::new_client_id;
use inferport_runtime::{ExecutionRouter, ImagePreprocessor, LocalBackendManager, ManagerConfig};
use tracing::{info, warn};

use config::{DaemonConfig, TransportKind};

/// Manager, offload client and router wired from configuration.
///
/// With the memory transport the loopback worker gets a manager of its own,
/// so serving offloads never touches the device's model or backend handle.
pub fn build_router<B: Backend + Clone>(
    backend: B,
    config: &DaemonConfig,
) -> Result<ExecutionRouter<B>> {
    let labels = match Labels::from_file(&config.labels_path) {
        Ok(labels) => labels,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "labels unavailable; using class_<index>");
            Labels::default()
        }
    };

    let manager_config = ManagerConfig {
        model_dir: config.model_dir.clone(),
        model: config.model(),
        max_threads: config.max_threads,
        input_cache: config.input_cache,
    };
    let manager = Arc::new(LocalBackendManager::new(
        backend.clone(),
        ImagePreprocessor,
        labels.clone(),
        manager_config.clone(),
    ));

    let offload = &config.offload;
    let client_id = offload.client_id.clone().unwrap_or_else(new_client_id);
    let transport: Arc<dyn PubSubTransport> = match offload.transport {
        TransportKind::Memory => {
            let broker = MemoryBroker::new();
            let worker =
                LocalBackendManager::new(backend, ImagePreprocessor, labels, manager_config);
            loopback::spawn_loopback_worker(broker.clone(), Arc::new(worker));
            Arc::new(broker.transport())
        }
        TransportKind::Mqtt => mqtt_transport(config, &client_id)?,
    };
    info!(
        %client_id,
        transport = transport.name(),
        backend = manager.backend_name(),
        model = %manager.current_model(),
        threads = manager.cpu_threads(),
        "runtime ready"
    );

    let client = Arc::new(OffloadClient::new(client_id, transport));
    Ok(ExecutionRouter::new(manager)
        .with_offload(client, offload.timeout())
        .with_default_mode(ExecMode::from(config.strategy())))
}

#[cfg(feature = "mqtt")]
fn mqtt_transport(config: &DaemonConfig, client_id: &str) -> Result<Arc<dyn PubSubTransport>> {
    use std::time::Duration;

    use inferport_offload::{MqttConfig, MqttTransport};

    let offload = &config.offload;
    let mut mqtt = MqttConfig::new(offload.broker_host.clone(), offload.broker_port, client_id);
    mqtt.keep_alive = Duration::from_secs(offload.keep_alive_secs);
    mqtt.connect_timeout = Duration::from_secs(offload.connect_timeout_secs);
    mqtt.max_packet_size = offload.max_packet_bytes;
    Ok(Arc::new(MqttTransport::new(mqtt)))
}

#[cfg(not(feature = "mqtt"))]
fn mqtt_transport(_config: &DaemonConfig, _client_id: &str) -> Result<Arc<dyn PubSubTransport>> {
    anyhow::bail!("mqtt transport requested but inferport-server was built without the `mqtt` feature")
}

/// Disconnects the offload client, cancelling anything still pending, and
/// releases the local backend.
pub async fn shutdown<B: Backend>(router: &ExecutionRouter<B>) {
    if let Some(client) = router.offload() {
        client.disconnect().await;
    }
    let manager = router.manager().clone();
    if tokio::task::spawn_blocking(move || manager.release()).await.is_err() {
        warn!("backend release task failed during shutdown");
    }
}
