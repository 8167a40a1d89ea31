mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, Overrides};
use inferport_backend_ort::OrtBackend;
use inferport_server::config::{DaemonConfig, TransportKind};
use inferport_server::schedule::{run_schedule, ImageSource, ScheduledTask};
use inferport_server::{build_router, http, shutdown};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .init();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    apply_overrides(&mut config, cli.overrides);

    match cli.command {
        Command::Serve { http_addr } => {
            if let Some(addr) = http_addr {
                config.http_addr = addr;
            }
            serve(config).await
        }
        Command::Run {
            tasks,
            image,
            image_dir,
            top_k,
            concurrent,
        } => {
            let schedule: Vec<ScheduledTask> =
                tasks.iter().map(|t| ScheduledTask::parse(t)).collect();
            let images = match image {
                Some(path) => ImageSource::Single(path),
                None => ImageSource::PerTask(image_dir),
            };
            let top_k = top_k.unwrap_or(config.top_k);
            run(config, schedule, images, top_k, concurrent).await
        }
    }
}

fn apply_overrides(config: &mut DaemonConfig, o: Overrides) {
    if let Some(dir) = o.model_dir {
        config.model_dir = dir;
    }
    if let Some(path) = o.labels {
        config.labels_path = path;
    }
    if let Some(model) = o.model {
        config.default_model = model;
    }
    if let Some(delegate) = o.delegate {
        config.default_strategy = delegate;
    }
    if let Some(host) = o.broker_host {
        config.offload.broker_host = host;
    }
    if let Some(port) = o.broker_port {
        config.offload.broker_port = port;
    }
    if let Some(ms) = o.timeout_ms {
        config.offload.timeout_ms = ms;
    }
    if o.loopback {
        config.offload.transport = TransportKind::Memory;
    }
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let router = build_router(OrtBackend::new(), &config)?;
    let state = Arc::new(http::AppState::new(
        router.clone(),
        config.strategy(),
        config.top_k,
    ));
    let app = http::router(state);

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "inferportd HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for shutdown signal");
            }
        })
        .await?;

    shutdown(&router).await;
    tracing::info!("inferportd stopped");
    Ok(())
}

async fn run(
    config: DaemonConfig,
    schedule: Vec<ScheduledTask>,
    images: ImageSource,
    top_k: usize,
    concurrent: bool,
) -> Result<()> {
    let router = build_router(OrtBackend::new(), &config)?;
    let result = run_schedule(&router, &schedule, &images, top_k, concurrent).await;
    shutdown(&router).await;

    let summary = result?;
    anyhow::ensure!(
        summary.failed == 0,
        "{} of {} tasks failed",
        summary.failed,
        summary.failed + summary.succeeded
    );
    Ok(())
}
