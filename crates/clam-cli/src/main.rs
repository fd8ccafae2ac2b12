//! Clam worker daemon
//!
//! Runs the reconciliation workers of the clam control plane until SIGINT or
//! SIGTERM. Any number of daemons may run side by side; each worker only
//! acts on the instance holding its lease.
//!
//! Usage:
//!   clam-worker --instance-id worker-1 --config clam.json
//!   clam-worker --dev-node node_local --dev-node node_spare

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use clam::store::EphemeralStore;
use clam::worker::jobs::standard_workers;
use clam::{ControlPlaneConfig, MemoryBackends, SandboxManager, SystemClock, WorkerScheduler};

/// How often development nodes beat.
const DEV_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Clam worker daemon - leader-elected reconciliation for microVM sandboxes
#[derive(Parser, Debug)]
#[command(name = "clam-worker")]
#[command(about = "Runs the clam reconciliation workers")]
struct Args {
    /// Identity used when taking worker leases
    #[arg(long, default_value_t = default_instance_id())]
    instance_id: String,

    /// JSON config file; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the node heartbeat TTL
    #[arg(long)]
    heartbeat_ttl_secs: Option<u64>,

    /// Register an in-memory node that heartbeats for the life of the process
    #[arg(long = "dev-node", value_name = "NODE_ID")]
    dev_nodes: Vec<String>,

    /// Slots on each development node
    #[arg(long, default_value_t = 8)]
    dev_node_slots: u32,
}

fn default_instance_id() -> String {
    format!("clam-worker-{}", std::process::id())
}

fn load_config(args: &Args) -> anyhow::Result<ControlPlaneConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ControlPlaneConfig::default(),
    };
    if let Some(secs) = args.heartbeat_ttl_secs {
        config.heartbeat_ttl = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let memory = MemoryBackends::new(Arc::new(SystemClock));
    for node_id in &args.dev_nodes {
        memory
            .add_node(node_id, args.dev_node_slots, config.heartbeat_ttl)
            .await
            .with_context(|| format!("registering dev node {node_id}"))?;
        tracing::info!(node_id = %node_id, slots = args.dev_node_slots, "dev node registered");
    }
    if !args.dev_nodes.is_empty() {
        tokio::spawn(beat(
            memory.store.clone(),
            args.dev_nodes.clone(),
            config.heartbeat_ttl,
        ));
    }

    let manager = SandboxManager::new(memory.backends(), config);
    let scheduler = WorkerScheduler::new(memory.store.clone(), args.instance_id.clone())
        .with_workers(standard_workers(&manager));
    tracing::info!(
        instance_id = %args.instance_id,
        workers = ?scheduler.worker_names(),
        "worker daemon started"
    );

    scheduler.run_until(shutdown_signal()).await;

    tracing::info!("worker daemon shut down");
    Ok(())
}

/// Keep development nodes alive the way real nodes do.
async fn beat(store: Arc<dyn EphemeralStore>, node_ids: Vec<String>, ttl: Duration) {
    let mut ticker = tokio::time::interval(DEV_HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        for node_id in &node_ids {
            if let Err(e) = store.register_heartbeat(node_id, ttl).await {
                tracing::warn!(node_id = %node_id, error = %e, "heartbeat failed");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down workers");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down workers");
        }
    }
}
