//! Connection gating based on trust.
//!
//! The gate is consulted at four points: before dialing a peer, before
//! dialing a specific address for it, when accepting a raw inbound
//! connection (identity not yet known, so the decision is deferred), and
//! after the handshake proves the remote peer id. No application bytes move
//! until the post-handshake check passes.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use peercompute_core::PeerId;

use crate::trust::TrustStore;

#[derive(Clone)]
pub struct ConnectionGate {
    trust: Arc<TrustStore>,
}

impl ConnectionGate {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        ConnectionGate { trust }
    }

    /// Outbound: allow dialing `peer` at all?
    pub fn intercept_peer_dial(&self, peer: &PeerId) -> bool {
        self.trust.is_trusted(peer)
    }

    /// Outbound: allow dialing this particular address for `peer`?
    /// Filtering is by peer id only; the address is not consulted.
    pub fn intercept_addr_dial(&self, peer: &PeerId, _addr: &SocketAddr) -> bool {
        self.trust.is_trusted(peer)
    }

    /// Inbound: a raw connection arrived. The peer id is unknown until the
    /// handshake completes, so the connection proceeds to it.
    pub fn intercept_accept(&self, _addr: &SocketAddr) -> bool {
        true
    }

    /// Both directions: the handshake proved `peer`. Untrusted peers are
    /// dropped here, before any application frame is read or written.
    pub fn intercept_secured(&self, peer: &PeerId) -> bool {
        let trusted = self.trust.is_trusted(peer);
        if !trusted {
            warn!(peer = %peer, "Dropping connection from untrusted peer");
        }
        trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercompute_core::Identity;

    #[test]
    fn test_gate_follows_trust_store() {
        let dir = tempfile::tempdir().unwrap();
        let trust = Arc::new(TrustStore::open(dir.path().join("peers.json")).unwrap());
        let gate = ConnectionGate::new(trust.clone());
        let id = Identity::generate().peer_id().clone();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert!(!gate.intercept_peer_dial(&id));
        assert!(gate.intercept_accept(&addr));
        assert!(!gate.intercept_secured(&id));

        trust.add(id.clone(), None, vec![]).unwrap();
        assert!(gate.intercept_peer_dial(&id));
        assert!(gate.intercept_addr_dial(&id, &addr));
        assert!(gate.intercept_secured(&id));

        // Removal flips every subsequent decision back to deny
        trust.remove(&id).unwrap();
        assert!(!gate.intercept_peer_dial(&id));
        assert!(!gate.intercept_secured(&id));
    }
}
