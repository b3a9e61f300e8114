use anyhow::Result;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use argus::cache::{CacheState, SharedCache};
use argus::enforcer;
use argus::extender::{self, GpuExtender, TelemetryExtender};
use argus::metrics::MetricsCache;
use argus::placement::PlacementOptions;
use argus::watch;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Run the GPU-aware scheduler extender (filter/bind)
    Gpu {
        /// Port for the extender HTTP endpoints
        #[arg(long, default_value_t = 9001)]
        port: u16,

        /// Resource whose per-card usage balances GPU selection
        #[arg(long)]
        balanced_resource: Option<String>,

        /// Honor gas-deny pod annotations
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        enable_denylist: bool,
    },
    /// Run the telemetry-aware scheduler extender (filter/prioritize)
    Telemetry {
        /// Port for the extender HTTP endpoints
        #[arg(long, default_value_t = 9002)]
        port: u16,

        /// Seconds between metric pulls and enforcement passes
        #[arg(long, default_value_t = 1)]
        polling_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    match args.command {
        Commands::Gpu {
            port,
            balanced_resource,
            enable_denylist,
        } => {
            run_gpu_extender(
                port,
                PlacementOptions {
                    balanced_resource,
                    enable_denylist,
                },
            )
            .await
        }
        Commands::Telemetry {
            port,
            polling_interval,
        } => run_telemetry_extender(port, Duration::from_secs(polling_interval.max(1))).await,
    }
}

async fn run_gpu_extender(port: u16, options: PlacementOptions) -> Result<()> {
    info!("starting GPU-aware scheduler extender");
    let client = Client::try_default().await?;
    let cache: SharedCache = Arc::new(RwLock::new(CacheState::default()));
    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let event_loops = tokio::spawn(watch::run(client.clone(), cache.clone(), token.clone()));

    let router = extender::gpu_router(GpuExtender {
        client,
        cache,
        options,
    });
    serve(router, port, token.clone()).await?;

    // server is down, stop the event loops too
    token.cancel();
    let _ = event_loops.await;
    Ok(())
}

async fn run_telemetry_extender(port: u16, interval: Duration) -> Result<()> {
    info!("starting telemetry-aware scheduler extender");
    let client = Client::try_default().await?;
    let registry: enforcer::SharedRegistry =
        Arc::new(RwLock::new(argus::strategy::PolicyRegistry::new()));
    let metrics = Arc::new(MetricsCache::new());
    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let enforcement = tokio::spawn(enforcer::run(
        client,
        registry.clone(),
        metrics.clone(),
        interval,
        token.clone(),
    ));

    let router = extender::telemetry_router(TelemetryExtender { registry, metrics });
    serve(router, port, token.clone()).await?;

    token.cancel();
    let _ = enforcement.await;
    Ok(())
}

async fn serve(router: axum::Router, port: u16, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "extender listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

/// SIGINT/SIGTERM close the stop token every long-lived loop observes.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}
