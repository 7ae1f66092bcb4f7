//! Peer Compute provider daemon.
//!
//! Runs on machines offering compute: loads the identity, checks the
//! container runtime, admits signed deployment requests from trusted peers,
//! and keeps a reverse tunnel open to the gateway for exposed deployments.
//! Every container is stopped and removed on shutdown.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peercompute_core::config::ProviderConfig;
use peercompute_core::Identity;
use peercompute_p2p::{ConnectionGate, Host, PeerClient, TrustStore};
use peercompute_runtime::{DockerRuntime, RuntimePort, SecurityPolicy};
use peercompute_scheduler::{watchdog, Scheduler, SchedulerConfig};
use peercompute_tunnel::client::{TunnelClient, TunnelClientConfig};

use handlers::ProviderHandlers;

fn cli() -> Command {
    Command::new("peercomputed")
        .about("Peer Compute provider daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("port")
                .long("port")
                .help("P2P listen port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("gateway")
                .long("gateway")
                .help("gateway tunnel address (host:port)"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("data directory (default: ~/.peercompute)"),
        )
        .arg(
            Arg::new("max-cpu")
                .long("max-cpu")
                .help("total CPU budget in millicores")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("max-memory")
                .long("max-memory")
                .help("total memory budget in bytes")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("max-deploys")
                .long("max-deploys")
                .help("maximum concurrent deployments")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("base-domain")
                .long("base-domain")
                .help("gateway base domain for exposed URLs"),
        )
}

fn load_config() -> (ProviderConfig, String) {
    let matches = cli().get_matches();
    let mut config = ProviderConfig::default();
    if let Some(port) = matches.get_one::<u16>("port") {
        config.listen_port = *port;
    }
    if let Some(gateway) = matches.get_one::<String>("gateway") {
        config.gateway_addr = Some(gateway.clone());
    }
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = dir.into();
    }
    if let Some(cpu) = matches.get_one::<i64>("max-cpu") {
        config.max_cpu_millicores = *cpu;
    }
    if let Some(memory) = matches.get_one::<i64>("max-memory") {
        config.max_memory_bytes = *memory;
    }
    if let Some(slots) = matches.get_one::<usize>("max-deploys") {
        config.max_deployments = *slots;
    }
    let base_domain = matches
        .get_one::<String>("base-domain")
        .cloned()
        .unwrap_or_else(|| "peercompute.example.com".to_string());
    (config, base_domain)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let (config, base_domain) = load_config();
    info!("Starting peercomputed v{}", env!("CARGO_PKG_VERSION"));

    // Identity; load failure is fatal
    let (identity, created) = Identity::load_or_generate(&config.identity_path())
        .context("failed to initialize identity")?;
    let identity = Arc::new(identity);
    if created {
        info!(peer = %identity.peer_id(), "Generated new identity");
    } else {
        info!(peer = %identity.peer_id(), "Loaded identity");
    }

    // Container runtime; an absent runtime is fatal
    let runtime: Arc<dyn RuntimePort> = Arc::new(DockerRuntime::new(SecurityPolicy {
        max_cpu_millicores: config.max_cpu_millicores,
        max_memory_bytes: config.max_memory_bytes,
    }));
    runtime
        .ping()
        .await
        .context("container runtime not available")?;

    // Crash cleanup: containers from a previous run carry our label
    match runtime.list_managed().await {
        Ok(orphans) if !orphans.is_empty() => {
            warn!(count = orphans.len(), "Removing containers left over from a previous run");
            if let Err(e) = runtime.cleanup_all().await {
                warn!(error = %e, "Crash cleanup incomplete");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not list managed containers"),
    }

    let scheduler = Arc::new(Scheduler::new(
        runtime.clone(),
        SchedulerConfig {
            max_deployments: config.max_deployments,
            max_cpu_millicores: config.max_cpu_millicores,
            max_memory_bytes: config.max_memory_bytes,
        },
    ));

    // Trust list
    let trust_path = config.trusted_peers_path();
    let trust = match TrustStore::open(&trust_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "Could not load trust list, starting empty");
            Arc::new(TrustStore::empty(&trust_path))
        }
    };
    info!(count = trust.count(), "Trusted peers loaded");

    let cancel = CancellationToken::new();

    // Reverse tunnel to the gateway, if configured
    let tunnel = config.gateway_addr.as_ref().map(|gateway_addr| {
        let client = TunnelClient::new(
            TunnelClientConfig {
                gateway_addr: gateway_addr.clone(),
                peer_id: identity.peer_id().to_string(),
                base_domain: base_domain.clone(),
            },
            cancel.clone(),
        );
        client.spawn();
        client
    });

    // P2P host; bind failure is fatal
    let gate = ConnectionGate::new(trust.clone());
    let listen_addr: SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    let host = Host::bind(listen_addr, identity.clone(), gate)
        .await
        .context("failed to bind P2P listener")?;

    let handler = Arc::new(ProviderHandlers::new(
        scheduler.clone(),
        runtime.clone(),
        trust.clone(),
        tunnel,
    ));
    tokio::spawn(host.run(handler, cancel.clone()));

    // Watchdog reaps deployments whose container died underneath them
    watchdog::spawn(
        scheduler.clone(),
        runtime.clone(),
        watchdog::DEFAULT_POLL_INTERVAL,
        cancel.clone(),
    );

    // Best-effort reachability probe of known peers
    {
        let client = PeerClient::new(identity.clone(), trust.clone());
        let peers = trust.list();
        tokio::spawn(async move {
            for peer in peers {
                if peer.addresses.is_empty() {
                    continue;
                }
                match client.open_stream(&peer.id).await {
                    Ok(mut stream) => {
                        info!(peer = %peer.id, "Peer reachable");
                        let _ = stream.close().await;
                    }
                    Err(e) => info!(peer = %peer.id, error = %e, "Peer not reachable"),
                }
            }
        });
    }

    info!(peer = %identity.peer_id(), "Provider ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();

    // Stop every deployment, then sweep anything the label still marks
    for (id, error) in scheduler.stop_all().await {
        warn!(deployment = %id, error = %error, "Shutdown stop failed");
    }
    if let Err(e) = runtime.cleanup_all().await {
        warn!(error = %e, "Final cleanup incomplete");
    }

    info!("Shutdown complete");
    Ok(())
}
