//! UDP ingest gateway binary
//!
//! Loads configuration, registers the protocol adapters, and runs the
//! UDP dispatcher alongside the HTTP observability server until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use udp_ingest_gateway::adapter::register_builtin_adapters;
use udp_ingest_gateway::api::{build_router, AppState};
use udp_ingest_gateway::config::Config;
use udp_ingest_gateway::dispatcher::UdpDispatcher;
use udp_ingest_gateway::hub::ChannelHub;
use udp_ingest_gateway::stats::global_stats;

#[derive(Parser, Debug)]
#[command(name = "udp-ingest-gateway", about = "UDP/QUIC media ingest gateway")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the UDP ingest port.
    #[arg(long)]
    listen_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("load configuration")?;
    if let Some(port) = args.listen_port {
        config.server.listen_port = port;
    }
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    tracing::info!(
        listen = %format!("{}:{}", config.server.listen_address, config.server.listen_port),
        http_port = config.server.http_port,
        protocol = %config.protocol.name,
        fec = %format!("k={} n={}", config.fec.k, config.fec.n),
        "starting UDP ingest gateway"
    );

    register_builtin_adapters(config.framed_config(), config.quicfec_config());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // The hub consumer stands in for the media source; a deployment
    // wires this receiver into its own distribution layer.
    let (hub, mut hub_rx) = ChannelHub::new(1024);
    let hub_handle = tokio::spawn(async move {
        let mut frames: u64 = 0;
        while let Some(frame) = hub_rx.recv().await {
            frames += 1;
            if frames % 500 == 1 {
                tracing::debug!(
                    stream = %frame.stream_id,
                    codec = %frame.codec,
                    dts_ms = frame.dts_ms,
                    frames,
                    "publishing to media hub"
                );
            }
        }
    });

    let dispatcher = UdpDispatcher::bind(config.clone(), Arc::new(hub))
        .await
        .context("bind UDP endpoint")?;
    let dispatcher_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run(shutdown_rx).await {
                tracing::error!(error = %e, "dispatcher terminated");
            }
        })
    };

    let state = AppState {
        stats: global_stats(),
    };
    let router = build_router(state);
    let http_addr = format!("{}:{}", config.server.listen_address, config.server.http_port);
    let listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind HTTP endpoint {http_addr}"))?;
    tracing::info!(addr = %http_addr, "HTTP observability server listening");

    let shutdown_for_http = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_for_http.send(());
        })
        .await?;

    let _ = shutdown_tx.send(());
    let _ = dispatcher_handle.await;
    hub_handle.abort();

    tracing::info!("UDP ingest gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
