//! eea-agent - Embedded Edge Agent host connected to an MQTT broker

mod cli;
mod console;
mod mqtt;
mod registered;

use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use eea_runtime::{
    AgentConfig, ArtifactStore, BlobStore, EdgeAgent, EeaRuntime, FileBlobStore, MemoryBlobStore,
    RuntimeConfig, forward_outbound, pump_events,
};
use mqtt::MqttTransport;

/// Transport events buffered between the MQTT task and the agent
const EVENT_CAPACITY: usize = 64;
/// Time allowed for each shutdown stage to flush
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;

    // RUST_LOG wins over the configured level
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, !cli.no_console))
}

async fn run(config: AgentConfig, console_enabled: bool) -> anyhow::Result<()> {
    let storage: Arc<dyn BlobStore> = match &config.storage_path {
        Some(path) => Arc::new(FileBlobStore::new(path)),
        None => {
            warn!("No storage path configured; workflow storage is not persisted");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let runtime = EeaRuntime::new(
        &RuntimeConfig::default(),
        config.device_id.clone(),
        config.instance_config(),
        registered::functions()?,
        storage,
        outbound_tx,
    )?;

    let (transport, event_loop) = MqttTransport::connect(&config);
    let transport = Arc::new(transport);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let mqtt_task = mqtt::spawn_event_loop(event_loop, event_tx);

    let artifacts = config.artifact_path.clone().map(ArtifactStore::new);
    let (agent, handle) = EdgeAgent::new(runtime, artifacts, config.agent_options());
    let agent_task = agent.spawn();
    let forwarder = forward_outbound(outbound_rx, transport);
    let pump = tokio::spawn(pump_events(event_rx, handle.clone()));

    info!(device_id = %config.device_id, "Embedded edge agent running");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = console::run(handle.clone()), if console_enabled => {}
    }

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "Agent shutdown failed");
    }
    drop(handle);

    if let Err(e) = agent_task.await {
        error!(error = %e, "Agent task panicked");
    }
    // The agent queued a disconnect behind the guest's last messages
    if tokio::time::timeout(DRAIN_TIMEOUT, forwarder).await.is_err() {
        warn!("Outbound messages still pending at exit");
    }
    pump.abort();

    // Let the event loop hand the queued publishes and the disconnect to the broker
    let mut mqtt_task = mqtt_task;
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut mqtt_task).await.is_err() {
        warn!("MQTT event loop did not finish; aborting");
        mqtt_task.abort();
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
