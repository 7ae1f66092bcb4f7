//! Gateway-side tunnel manager.
//!
//! One `ProviderTunnel` per connected provider. The manager keeps two
//! indices under one lock (peer id → tunnel, deployment id → tunnel, plus
//! the label table enforcing subdomain uniqueness); each tunnel owns its
//! pending-request map. The index lock and the per-tunnel locks are never
//! held at the same time, and no I/O happens under either.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peercompute_core::signing::unix_nanos;

use crate::frame::{public_url, subdomain_label, FrameWriter, TunnelFrame, HEALTH_WINDOW, REQUEST_TIMEOUT};
use crate::{TunnelError, TunnelResult};

/// A decoded HTTP response travelling back through the tunnel.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// State for one connected provider.
pub struct ProviderTunnel {
    writer: FrameWriter<OwnedWriteHalf>,
    peer_id: Mutex<Option<String>>,
    /// deployment id → container-local port on the provider
    routes: Mutex<HashMap<String, u16>>,
    /// request id → single-slot response channel
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseParts>>>,
    last_seen: Mutex<Instant>,
}

impl ProviderTunnel {
    fn new(write_half: OwnedWriteHalf) -> Self {
        ProviderTunnel {
            writer: FrameWriter::new(write_half),
            peer_id: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().expect("tunnel lock poisoned") = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("tunnel lock poisoned")
    }

    /// Install a fresh response slot. The returned id is unique within the
    /// pending map; a nanosecond collision retries with a suffix.
    fn install_slot(&self) -> (String, oneshot::Receiver<ResponseParts>) {
        let (tx, rx) = oneshot::channel();
        let nanos = unix_nanos(Utc::now());
        let mut pending = self.pending.lock().expect("tunnel lock poisoned");
        let mut attempt = 0u32;
        loop {
            let id = if attempt == 0 {
                nanos.to_string()
            } else {
                format!("{nanos}-{attempt}")
            };
            if !pending.contains_key(&id) {
                pending.insert(id.clone(), tx);
                return (id, rx);
            }
            attempt += 1;
        }
    }

    fn remove_slot(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("tunnel lock poisoned")
            .remove(request_id);
    }

    /// Deliver a response to its waiting slot. Late or duplicate responses
    /// find no slot and are dropped silently.
    fn complete(&self, request_id: &str, parts: ResponseParts) {
        let sender = self
            .pending
            .lock()
            .expect("tunnel lock poisoned")
            .remove(request_id);
        if let Some(tx) = sender {
            let _ = tx.send(parts);
        } else {
            debug!(request_id = %request_id, "Dropping late response");
        }
    }

    /// Drop every pending slot, waking the waiters with a channel error.
    fn drain_pending(&self) {
        let drained: HashMap<_, _> = std::mem::take(
            &mut *self.pending.lock().expect("tunnel lock poisoned"),
        );
        if !drained.is_empty() {
            debug!(count = drained.len(), "Draining in-flight tunnel requests");
        }
        // Senders drop here; receivers observe tunnel-gone
    }
}

#[derive(Default)]
struct Indexes {
    /// peer id → tunnel
    tunnels: HashMap<String, Arc<ProviderTunnel>>,
    /// deployment id → owning tunnel
    routes: HashMap<String, Arc<ProviderTunnel>>,
    /// subdomain label → deployment id, unique across all tunnels
    labels: HashMap<String, String>,
}

pub struct TunnelManager {
    indexes: Mutex<Indexes>,
    base_domain: String,
}

impl TunnelManager {
    pub fn new(base_domain: impl Into<String>) -> Arc<Self> {
        Arc::new(TunnelManager {
            indexes: Mutex::new(Indexes::default()),
            base_domain: base_domain.into(),
        })
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Accept loop for provider tunnel connections.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "Tunnel listener ready");
        loop {
            let (conn, remote) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Tunnel listener shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Tunnel accept failed");
                        continue;
                    }
                },
            };
            debug!(remote = %remote, "Provider tunnel connected");
            let manager = self.clone();
            tokio::spawn(async move {
                manager.handle_connection(conn).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, conn: tokio::net::TcpStream) {
        let (read_half, write_half) = conn.into_split();
        let tunnel = Arc::new(ProviderTunnel::new(write_half));

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Tunnel read error");
                    break;
                }
            };
            let frame = match TunnelFrame::from_line(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Invalid tunnel frame, ignoring");
                    continue;
                }
            };
            tunnel.touch();

            match frame {
                TunnelFrame::Register {
                    deployment_id,
                    port,
                    peer_id,
                } => {
                    let result = self.register(&tunnel, &peer_id, &deployment_id, port);
                    let ack = TunnelFrame::Registered {
                        deployment_id: deployment_id.clone(),
                        error: result.as_ref().err().map(|e| e.to_string()),
                    };
                    if let Ok(url) = &result {
                        info!(deployment = %deployment_id, provider = %peer_id, url = %url, "Route registered");
                    }
                    if tunnel.writer.send(&ack).await.is_err() {
                        break;
                    }
                }
                TunnelFrame::Unregister { deployment_id } => {
                    self.unregister(&tunnel, &deployment_id);
                    info!(deployment = %deployment_id, "Route unregistered");
                }
                TunnelFrame::Response {
                    request_id,
                    status_code,
                    headers,
                    body,
                } => {
                    tunnel.complete(
                        &request_id,
                        ResponseParts {
                            status_code,
                            headers,
                            body,
                        },
                    );
                }
                TunnelFrame::Heartbeat => {}
                other => {
                    debug!(frame = ?other, "Unexpected frame direction, ignoring");
                }
            }
        }

        self.teardown(&tunnel);
    }

    /// Install a route for a deployment. Fails with route-conflict when the
    /// label is already owned by a different deployment.
    fn register(
        &self,
        tunnel: &Arc<ProviderTunnel>,
        peer_id: &str,
        deployment_id: &str,
        port: u16,
    ) -> TunnelResult<String> {
        let label = subdomain_label(deployment_id);
        {
            let mut indexes = self.indexes.lock().expect("tunnel index lock poisoned");
            if let Some(owner) = indexes.labels.get(&label) {
                if owner != deployment_id {
                    return Err(TunnelError::RouteConflict(label));
                }
            }
            indexes
                .tunnels
                .insert(peer_id.to_string(), tunnel.clone());
            indexes
                .routes
                .insert(deployment_id.to_string(), tunnel.clone());
            indexes.labels.insert(label, deployment_id.to_string());
        }

        tunnel
            .routes
            .lock()
            .expect("tunnel lock poisoned")
            .insert(deployment_id.to_string(), port);
        let mut stored_peer = tunnel.peer_id.lock().expect("tunnel lock poisoned");
        if stored_peer.is_none() {
            *stored_peer = Some(peer_id.to_string());
        }

        Ok(public_url(deployment_id, &self.base_domain))
    }

    fn unregister(&self, tunnel: &Arc<ProviderTunnel>, deployment_id: &str) {
        let label = subdomain_label(deployment_id);
        {
            let mut indexes = self.indexes.lock().expect("tunnel index lock poisoned");
            if let Some(owner) = indexes.routes.get(deployment_id) {
                if Arc::ptr_eq(owner, tunnel) {
                    indexes.routes.remove(deployment_id);
                    indexes.labels.remove(&label);
                }
            }
        }
        tunnel
            .routes
            .lock()
            .expect("tunnel lock poisoned")
            .remove(deployment_id);
    }

    /// Tunnel disconnected: wake in-flight requests first, then purge every
    /// index entry the tunnel owned, so new requests observe the absence
    /// rather than hanging.
    fn teardown(&self, tunnel: &Arc<ProviderTunnel>) {
        tunnel.drain_pending();

        let owned: Vec<String> = tunnel
            .routes
            .lock()
            .expect("tunnel lock poisoned")
            .keys()
            .cloned()
            .collect();
        let peer_id = tunnel.peer_id.lock().expect("tunnel lock poisoned").clone();

        let mut indexes = self.indexes.lock().expect("tunnel index lock poisoned");
        for deployment_id in owned {
            if let Some(owner) = indexes.routes.get(&deployment_id) {
                if Arc::ptr_eq(owner, tunnel) {
                    indexes.routes.remove(&deployment_id);
                    indexes.labels.remove(&subdomain_label(&deployment_id));
                }
            }
        }
        if let Some(peer_id) = peer_id {
            if let Some(current) = indexes.tunnels.get(&peer_id) {
                if Arc::ptr_eq(current, tunnel) {
                    indexes.tunnels.remove(&peer_id);
                    info!(provider = %peer_id, "Provider tunnel disconnected");
                }
            }
        }
    }

    /// Route one public HTTP request through the owning tunnel and wait for
    /// the correlated response.
    pub async fn forward(
        &self,
        label: &str,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> TunnelResult<ResponseParts> {
        self.forward_with_timeout(label, method, path, headers, body, REQUEST_TIMEOUT)
            .await
    }

    pub(crate) async fn forward_with_timeout(
        &self,
        label: &str,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> TunnelResult<ResponseParts> {
        let (deployment_id, tunnel) = {
            let indexes = self.indexes.lock().expect("tunnel index lock poisoned");
            let deployment_id = indexes
                .labels
                .get(label)
                .cloned()
                .ok_or_else(|| TunnelError::NotFound(label.to_string()))?;
            let tunnel = indexes
                .routes
                .get(&deployment_id)
                .cloned()
                .ok_or_else(|| TunnelError::NotFound(label.to_string()))?;
            (deployment_id, tunnel)
        };

        // The slot exists before the request frame is on the wire, so the
        // response cannot race it.
        let (request_id, rx) = tunnel.install_slot();
        let frame = TunnelFrame::Request {
            request_id: request_id.clone(),
            deployment_id,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };
        if let Err(e) = tunnel.writer.send(&frame).await {
            tunnel.remove_slot(&request_id);
            debug!(error = %e, "Failed to write request frame");
            return Err(TunnelError::TunnelGone);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(parts)) => Ok(parts),
            Ok(Err(_)) => Err(TunnelError::TunnelGone),
            Err(_) => {
                tunnel.remove_slot(&request_id);
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Whether a provider heartbeated recently.
    pub fn healthy(&self, peer_id: &str) -> bool {
        let tunnel = {
            let indexes = self.indexes.lock().expect("tunnel index lock poisoned");
            indexes.tunnels.get(peer_id).cloned()
        };
        match tunnel {
            Some(tunnel) => tunnel.last_seen().elapsed() < HEALTH_WINDOW,
            None => false,
        }
    }

    pub fn connected_providers(&self) -> Vec<String> {
        let indexes = self.indexes.lock().expect("tunnel index lock poisoned");
        indexes.tunnels.keys().cloned().collect()
    }

    pub fn route_count(&self) -> usize {
        let indexes = self.indexes.lock().expect("tunnel index lock poisoned");
        indexes.routes.len()
    }
}
