//! Listening side of the P2P fabric.
//!
//! The host accepts TCP connections, runs the secured handshake, applies the
//! connection gate, reads the single request frame, and hands the stream to
//! the registered handler. Each connection runs on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peercompute_core::codec::Frame;
use peercompute_core::Identity;

use crate::error::P2pResult;
use crate::gate::ConnectionGate;
use crate::transport::SecureStream;

/// How long a secured connection may take to deliver its request frame.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one inbound request stream. The frame is the first (and for all
/// protocols except logs, only) message the peer sent.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, stream: SecureStream, frame: Frame);
}

pub struct Host {
    listener: TcpListener,
    identity: Arc<Identity>,
    gate: ConnectionGate,
}

impl Host {
    /// Bind the P2P listener. Failure here is fatal to the daemon.
    pub async fn bind(addr: SocketAddr, identity: Arc<Identity>, gate: ConnectionGate) -> P2pResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, peer = %identity.peer_id(), "P2P host listening");
        Ok(Host {
            listener,
            identity,
            gate,
        })
    }

    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the cancellation token fires.
    pub async fn run(self, handler: Arc<dyn RequestHandler>, cancel: CancellationToken) {
        loop {
            let (conn, remote) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("P2P host shutting down");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if !self.gate.intercept_accept(&remote) {
                continue;
            }

            let identity = self.identity.clone();
            let gate = self.gate.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut stream = match SecureStream::accept(conn, &identity).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(remote = %remote, error = %e, "Handshake failed");
                        return;
                    }
                };

                if !gate.intercept_secured(stream.remote_peer()) {
                    let _ = stream.close().await;
                    return;
                }

                let frame = match timeout(REQUEST_READ_TIMEOUT, stream.recv_frame()).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        debug!(peer = %stream.remote_peer(), error = %e, "Failed to read request");
                        return;
                    }
                    Err(_) => {
                        debug!(peer = %stream.remote_peer(), "Request read timed out");
                        return;
                    }
                };

                handler.handle(stream, frame).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PeerClient;
    use crate::trust::TrustStore;
    use peercompute_core::message::{MessageType, StatusRequest, StatusResponse};

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, mut stream: SecureStream, frame: Frame) {
            let req: StatusRequest = frame.decode().unwrap();
            let resp = StatusResponse {
                deployments: Vec::new(),
                resource_usage: None,
                error: None,
            };
            assert!(req.deployment_id.is_some());
            stream
                .send_frame(MessageType::StatusResponse, &resp)
                .await
                .unwrap();
        }
    }

    async fn start_host(trust: Arc<TrustStore>) -> (Arc<Identity>, std::net::SocketAddr) {
        let identity = Arc::new(Identity::generate());
        let gate = ConnectionGate::new(trust);
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), identity.clone(), gate)
            .await
            .unwrap();
        let addr = host.local_addr().unwrap();
        tokio::spawn(host.run(Arc::new(EchoHandler), CancellationToken::new()));
        (identity, addr)
    }

    #[tokio::test]
    async fn test_trusted_peer_gets_a_response() {
        let dir = tempfile::tempdir().unwrap();
        let server_trust = Arc::new(TrustStore::open(dir.path().join("server.json")).unwrap());
        let client_trust = Arc::new(TrustStore::open(dir.path().join("client.json")).unwrap());

        let client_identity = Arc::new(Identity::generate());
        server_trust
            .add(client_identity.peer_id().clone(), None, vec![])
            .unwrap();

        let (server_identity, addr) = start_host(server_trust).await;
        client_trust
            .add(
                server_identity.peer_id().clone(),
                None,
                vec![addr.to_string()],
            )
            .unwrap();

        let client = PeerClient::new(client_identity, client_trust);
        let resp = client
            .status(server_identity.peer_id(), Some("dep-1".into()))
            .await
            .unwrap();
        assert!(resp.deployments.is_empty());
    }

    #[tokio::test]
    async fn test_untrusted_peer_is_dropped_after_handshake() {
        let dir = tempfile::tempdir().unwrap();
        // Server trusts nobody
        let server_trust = Arc::new(TrustStore::open(dir.path().join("server.json")).unwrap());
        let client_trust = Arc::new(TrustStore::open(dir.path().join("client.json")).unwrap());

        let (server_identity, addr) = start_host(server_trust).await;
        client_trust
            .add(
                server_identity.peer_id().clone(),
                None,
                vec![addr.to_string()],
            )
            .unwrap();

        let client_identity = Arc::new(Identity::generate());
        let client = PeerClient::new(client_identity, client_trust);

        // The handshake itself completes, but the gate drops the stream
        // before any response; no protocol bytes come back.
        let result = client
            .status(server_identity.peer_id(), Some("dep-1".into()))
            .await;
        assert!(result.is_err());
    }
}
