//! GridRun Coordinator Server

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridrun_coordinator::{http, spawn_sweeper, Config, Coordinator};

/// GridRun coordinator: hands compute tasks to volunteer workers.
#[derive(Parser, Debug)]
#[command(name = "gridrun-coordinator", about = "GridRun volunteer compute coordinator")]
struct Args {
    /// HTTP/WebSocket bind address
    #[arg(long, env = "GRIDRUN_BIND_ADDR", default_value = "0.0.0.0:8765")]
    bind_addr: String,

    /// Reclamation sweep period in milliseconds
    #[arg(long, env = "GRIDRUN_SWEEP_INTERVAL_MS", default_value = "1000")]
    sweep_interval_ms: u64,

    /// Heartbeat silence before a worker is pruned, in seconds
    #[arg(long, env = "GRIDRUN_HEARTBEAT_TIMEOUT_SECS", default_value = "120")]
    heartbeat_timeout_secs: u64,

    /// Upper bound on queueing one message for a worker, in seconds
    #[arg(long, env = "GRIDRUN_SEND_TIMEOUT_SECS", default_value = "5")]
    send_timeout_secs: u64,

    /// Assignment timeout for tasks submitted without one, in seconds
    #[arg(long, env = "GRIDRUN_DEFAULT_TIMEOUT_SECS", default_value = "60")]
    default_timeout_secs: u64,

    /// Retry budget for tasks submitted without one
    #[arg(long, env = "GRIDRUN_DEFAULT_MAX_RETRIES", default_value = "3")]
    default_max_retries: u32,

    /// Outbound message buffer per worker connection
    #[arg(long, env = "GRIDRUN_OUTBOUND_BUFFER", default_value = "32")]
    outbound_buffer: usize,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            bind_addr: self.bind_addr,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            default_timeout_seconds: self.default_timeout_secs,
            default_max_retries: self.default_max_retries,
            outbound_buffer: self.outbound_buffer.max(1),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gridrun=info".parse()?))
        .with_target(true)
        .init();

    let config = args.into_config();
    let addr: SocketAddr = config.bind_addr.parse()?;

    info!(
        addr = %addr,
        sweep_interval = ?config.sweep_interval,
        heartbeat_timeout = ?config.heartbeat_timeout,
        "Starting GridRun coordinator"
    );

    let coordinator = Coordinator::new(config);
    let sweeper = spawn_sweeper(coordinator.clone());

    let router = http::create_router(coordinator);
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {} (workers at /ws/compute)", addr);

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    info!("Coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
