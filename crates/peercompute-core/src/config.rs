//! Daemon and gateway configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::identity::default_data_dir;

/// Default P2P listen port
pub const DEFAULT_LISTEN_PORT: u16 = 9000;

/// Default tunnel listen port on the gateway
pub const DEFAULT_TUNNEL_PORT: u16 = 8443;

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Provider daemon configuration. Environment variables override defaults;
/// command-line flags override both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub listen_port: u16,
    /// Gateway tunnel address (`host:port`); tunneling disabled when absent
    #[serde(default)]
    pub gateway_addr: Option<String>,
    pub data_dir: PathBuf,
    pub max_cpu_millicores: i64,
    pub max_memory_bytes: i64,
    pub max_deployments: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            listen_port: DEFAULT_LISTEN_PORT,
            gateway_addr: None,
            data_dir: default_data_dir(),
            max_cpu_millicores: env_i64("PEERCOMPUTE_MAX_CPU").unwrap_or(4000),
            max_memory_bytes: env_i64("PEERCOMPUTE_MAX_MEMORY")
                .unwrap_or(4 * 1024 * 1024 * 1024),
            max_deployments: env_i64("PEERCOMPUTE_MAX_DEPLOYS").unwrap_or(10) as usize,
        }
    }
}

impl ProviderConfig {
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(crate::identity::KEY_FILE_NAME)
    }

    pub fn trusted_peers_path(&self) -> PathBuf {
        self.data_dir.join("trusted_peers.json")
    }
}

/// Gateway daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub tunnel_port: u16,
    /// Base domain under which deployment subdomains are published
    pub base_domain: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            http_port: 8080,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            base_domain: "peercompute.example.com".to_string(),
        }
    }
}
