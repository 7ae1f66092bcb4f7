//! Trust store: the explicit list of peers this node will talk to.
//!
//! Trust is bilateral and manual. A peer must be added here before any
//! connection to or from it is admitted; removal takes effect for every
//! subsequent gate decision. The store is persisted as a JSON array with
//! owner-only permissions and rewritten atomically on every mutation.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use peercompute_core::PeerId;

use crate::error::{P2pError, P2pResult};

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

/// A peer that has been explicitly trusted by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// In-memory trust map backed by a JSON file.
pub struct TrustStore {
    peers: RwLock<HashMap<PeerId, TrustedPeer>>,
    path: PathBuf,
}

impl TrustStore {
    /// Open the store at `path`, loading the existing file if present.
    pub fn open(path: impl Into<PathBuf>) -> P2pResult<Self> {
        let path = path.into();
        let mut peers = HashMap::new();
        if path.exists() {
            let data = fs::read(&path)?;
            let list: Vec<TrustedPeer> = serde_json::from_slice(&data)
                .map_err(peercompute_core::CoreError::from)?;
            for peer in list {
                peers.insert(peer.id.clone(), peer);
            }
        }
        Ok(TrustStore {
            peers: RwLock::new(peers),
            path,
        })
    }

    /// An empty store at `path`, used when the backing file is unreadable.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        TrustStore {
            peers: RwLock::new(HashMap::new()),
            path: path.into(),
        }
    }

    /// Add a peer, or update its name and addresses if already present.
    pub fn add(
        &self,
        id: PeerId,
        name: Option<String>,
        addresses: Vec<String>,
    ) -> P2pResult<()> {
        let mut peers = self.peers.write().expect("trust store lock poisoned");
        let entry = peers.entry(id.clone()).or_insert_with(|| TrustedPeer {
            id: id.clone(),
            name: None,
            added_at: Utc::now(),
            addresses: Vec::new(),
        });
        if name.is_some() {
            entry.name = name;
        }
        if !addresses.is_empty() {
            entry.addresses = addresses;
        }
        debug!(peer = %id, "Trust store add");
        self.persist(&peers)
    }

    /// Remove a peer. Subsequent gate decisions for it will deny.
    pub fn remove(&self, id: &PeerId) -> P2pResult<()> {
        let mut peers = self.peers.write().expect("trust store lock poisoned");
        if peers.remove(id).is_none() {
            return Err(P2pError::UnknownPeer(id.clone()));
        }
        debug!(peer = %id, "Trust store remove");
        self.persist(&peers)
    }

    pub fn is_trusted(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .expect("trust store lock poisoned")
            .contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<TrustedPeer> {
        self.peers
            .read()
            .expect("trust store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Look up a peer by exact id string or by display name.
    pub fn resolve(&self, id_or_name: &str) -> Option<TrustedPeer> {
        let peers = self.peers.read().expect("trust store lock poisoned");
        if let Ok(id) = PeerId::parse(id_or_name) {
            if let Some(peer) = peers.get(&id) {
                return Some(peer.clone());
            }
        }
        peers
            .values()
            .find(|p| p.name.as_deref() == Some(id_or_name))
            .cloned()
    }

    pub fn list(&self) -> Vec<TrustedPeer> {
        let peers = self.peers.read().expect("trust store lock poisoned");
        let mut list: Vec<TrustedPeer> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        list
    }

    pub fn count(&self) -> usize {
        self.peers.read().expect("trust store lock poisoned").len()
    }

    /// Rewrite the backing file: serialize to a temp file in the same
    /// directory, then rename over the original.
    fn persist(&self, peers: &HashMap<PeerId, TrustedPeer>) -> P2pResult<()> {
        let mut list: Vec<&TrustedPeer> = peers.values().collect();
        list.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        let data = serde_json::to_vec_pretty(&list).map_err(peercompute_core::CoreError::from)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(DIR_MODE)
                    .create(dir)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(FILE_MODE))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
