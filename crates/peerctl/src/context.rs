//! Shared command context: data directory, identity, and trust store.

use std::path::PathBuf;
use std::sync::Arc;

use peercompute_core::identity::{default_data_dir, KEY_FILE_NAME};
use peercompute_core::{Identity, PeerId};
use peercompute_p2p::{P2pError, PeerClient, TrustStore, TrustedPeer};

use crate::CliError;

pub struct Context {
    pub data_dir: PathBuf,
}

impl Context {
    pub fn new() -> Self {
        Context {
            data_dir: default_data_dir(),
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE_NAME)
    }

    pub fn trusted_peers_path(&self) -> PathBuf {
        self.data_dir.join("trusted_peers.json")
    }

    pub fn load_identity(&self) -> Result<Arc<Identity>, CliError> {
        let (identity, _) = Identity::load_or_generate(&self.identity_path())
            .map_err(|e| CliError::User(format!("cannot load identity: {e}")))?;
        Ok(Arc::new(identity))
    }

    pub fn open_trust(&self) -> Result<Arc<TrustStore>, CliError> {
        TrustStore::open(self.trusted_peers_path())
            .map(Arc::new)
            .map_err(|e| CliError::User(format!("cannot load trust list: {e}")))
    }

    pub fn client(&self) -> Result<(PeerClient, Arc<TrustStore>, Arc<Identity>), CliError> {
        let identity = self.load_identity()?;
        let trust = self.open_trust()?;
        Ok((
            PeerClient::new(identity.clone(), trust.clone()),
            trust,
            identity,
        ))
    }

    /// Resolve `--peer` input: an exact peer id or a display name.
    pub fn resolve_peer(trust: &TrustStore, id_or_name: &str) -> Result<TrustedPeer, CliError> {
        trust.resolve(id_or_name).ok_or_else(|| {
            CliError::User(format!(
                "peer '{id_or_name}' is not in the trust list; add it with `peerctl peers add`"
            ))
        })
    }
}

/// Classify a P2P failure for the exit-code contract: trust problems are
/// user errors, everything else is a transport error.
pub fn map_p2p_error(err: P2pError) -> CliError {
    match err {
        P2pError::Untrusted(peer) => CliError::User(format!("peer {peer} is not trusted")),
        P2pError::UnknownPeer(peer) => {
            CliError::User(format!("peer {peer} is not in the trust list"))
        }
        P2pError::NoAddress(peer) => {
            CliError::User(format!("no known address for peer {peer}"))
        }
        other => CliError::Transport(other.to_string()),
    }
}

pub fn parse_peer_id(s: &str) -> Result<PeerId, CliError> {
    PeerId::parse(s).map_err(|_| CliError::User(format!("invalid peer id: {s}")))
}
