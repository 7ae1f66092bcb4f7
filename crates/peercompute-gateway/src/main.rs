//! Peer Compute gateway daemon.
//!
//! Public entry point for exposed deployments: accepts reverse tunnel
//! connections from providers on one port and public HTTP traffic on
//! another, routing each request through the owning provider's tunnel.
//! TLS termination (ACME) sits in front of this process in production.

mod ingress;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peercompute_core::config::GatewayConfig;
use peercompute_tunnel::TunnelManager;

use ingress::GatewayState;

fn cli() -> Command {
    Command::new("peercompute-gateway")
        .about("public ingress and reverse-tunnel server for Peer Compute")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("http-port")
                .long("http-port")
                .help("public HTTP port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("tunnel-port")
                .long("tunnel-port")
                .help("provider tunnel port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("domain")
                .long("domain")
                .help("base domain for deployment subdomains"),
        )
}

fn load_config() -> GatewayConfig {
    let matches = cli().get_matches();
    let mut config = GatewayConfig::default();
    if let Some(port) = matches.get_one::<u16>("http-port") {
        config.http_port = *port;
    }
    if let Some(port) = matches.get_one::<u16>("tunnel-port") {
        config.tunnel_port = *port;
    }
    if let Some(domain) = matches.get_one::<String>("domain") {
        config.base_domain = domain.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = load_config();
    info!(
        domain = %config.base_domain,
        http_port = config.http_port,
        tunnel_port = config.tunnel_port,
        "Starting Peer Compute gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cancel = CancellationToken::new();
    let manager = TunnelManager::new(config.base_domain.clone());

    // Provider tunnel listener; bind failure is fatal
    let tunnel_addr: SocketAddr = ([0, 0, 0, 0], config.tunnel_port).into();
    let tunnel_listener = TcpListener::bind(tunnel_addr)
        .await
        .with_context(|| format!("failed to bind tunnel listener on {tunnel_addr}"))?;
    tokio::spawn(
        manager
            .clone()
            .run_listener(tunnel_listener, cancel.clone()),
    );

    // Public ingress
    let app = ingress::router(GatewayState {
        manager: manager.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    info!(addr = %http_addr, "Gateway ready");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Shutdown complete");
    Ok(())
}
