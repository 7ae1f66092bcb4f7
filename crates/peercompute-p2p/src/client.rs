//! Dialing side of the P2P fabric.
//!
//! Opens one secured stream per request, verifying the gate before dialing
//! and again once the handshake proves the remote peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use peercompute_core::message::{
    DeployRequest, DeployResponse, LogsRequest, MessageType, StatusRequest, StatusResponse,
    StopRequest, StopResponse,
};
use peercompute_core::{signing, Identity, PeerId};

use crate::error::{P2pError, P2pResult};
use crate::gate::ConnectionGate;
use crate::transport::SecureStream;
use crate::trust::TrustStore;

/// Timeout for establishing and securing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PeerClient {
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    gate: ConnectionGate,
}

impl PeerClient {
    pub fn new(identity: Arc<Identity>, trust: Arc<TrustStore>) -> Self {
        let gate = ConnectionGate::new(trust.clone());
        PeerClient {
            identity,
            trust,
            gate,
        }
    }

    /// Open a secured stream to `peer`, trying its stored addresses in order.
    pub async fn open_stream(&self, peer: &PeerId) -> P2pResult<SecureStream> {
        if !self.gate.intercept_peer_dial(peer) {
            return Err(P2pError::Untrusted(peer.clone()));
        }

        let trusted = self
            .trust
            .get(peer)
            .ok_or_else(|| P2pError::UnknownPeer(peer.clone()))?;
        if trusted.addresses.is_empty() {
            return Err(P2pError::NoAddress(peer.clone()));
        }

        let mut last_err = P2pError::NoAddress(peer.clone());
        for addr_str in &trusted.addresses {
            let addr: SocketAddr = match addr_str.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    debug!(peer = %peer, addr = %addr_str, "Skipping unparseable address");
                    continue;
                }
            };
            if !self.gate.intercept_addr_dial(peer, &addr) {
                return Err(P2pError::Untrusted(peer.clone()));
            }

            match self.dial(peer, addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(peer = %peer, addr = %addr, error = %e, "Dial attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial(&self, peer: &PeerId, addr: SocketAddr) -> P2pResult<SecureStream> {
        let conn = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::ConnectTimeout)??;
        let stream = timeout(CONNECT_TIMEOUT, SecureStream::connect(conn, &self.identity))
            .await
            .map_err(|_| P2pError::ConnectTimeout)??;

        // The proven identity must be the peer we meant to dial, and must
        // still pass the gate.
        if stream.remote_peer() != peer {
            return Err(P2pError::Handshake(format!(
                "address {addr} answered as {} instead of {peer}",
                stream.remote_peer()
            )));
        }
        if !self.gate.intercept_secured(stream.remote_peer()) {
            return Err(P2pError::Untrusted(peer.clone()));
        }
        Ok(stream)
    }

    /// Sign and send a deployment request; wait for the provider's response.
    pub async fn deploy(&self, peer: &PeerId, mut req: DeployRequest) -> P2pResult<DeployResponse> {
        signing::sign_deploy(&mut req, &self.identity, Utc::now())?;
        let mut stream = self.open_stream(peer).await?;
        stream.send_frame(MessageType::DeployRequest, &req).await?;
        let frame = stream.recv_frame().await?;
        let resp: DeployResponse = frame.decode()?;
        let _ = stream.close().await;
        Ok(resp)
    }

    /// Sign and send a stop request.
    pub async fn stop(&self, peer: &PeerId, deployment_id: String) -> P2pResult<StopResponse> {
        let mut req = StopRequest {
            deployment_id,
            requester_id: self.identity.peer_id().clone(),
            timestamp: 0,
            signature: Vec::new(),
        };
        signing::sign_stop(&mut req, &self.identity, Utc::now())?;
        let mut stream = self.open_stream(peer).await?;
        stream.send_frame(MessageType::StopRequest, &req).await?;
        let frame = stream.recv_frame().await?;
        let resp: StopResponse = frame.decode()?;
        let _ = stream.close().await;
        Ok(resp)
    }

    /// Query deployment status.
    pub async fn status(
        &self,
        peer: &PeerId,
        deployment_id: Option<String>,
    ) -> P2pResult<StatusResponse> {
        let req = StatusRequest { deployment_id };
        let mut stream = self.open_stream(peer).await?;
        stream.send_frame(MessageType::StatusRequest, &req).await?;
        let frame = stream.recv_frame().await?;
        let resp: StatusResponse = frame.decode()?;
        let _ = stream.close().await;
        Ok(resp)
    }

    /// Open a log stream. The returned stream yields `LogEntry` frames until
    /// the provider closes it.
    pub async fn logs(
        &self,
        peer: &PeerId,
        deployment_id: String,
        follow: bool,
        tail: Option<usize>,
    ) -> P2pResult<SecureStream> {
        let req = LogsRequest {
            deployment_id,
            follow,
            tail,
        };
        let mut stream = self.open_stream(peer).await?;
        stream.send_frame(MessageType::LogsRequest, &req).await?;
        Ok(stream)
    }
}
