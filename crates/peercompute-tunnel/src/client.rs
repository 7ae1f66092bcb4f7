//! Provider-side tunnel client.
//!
//! Maintains one outbound connection to the gateway, re-establishing it on
//! an exponential back-off and re-registering every exposed deployment after
//! each reconnect. Incoming request frames are replayed against the
//! container's loopback port, each on its own task; the shared write half is
//! serialized by the frame writer's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{
    public_url, FrameWriter, TunnelFrame, HEARTBEAT_INTERVAL, RECONNECT_BASE, RECONNECT_CAP,
    REQUEST_TIMEOUT,
};
use crate::{TunnelError, TunnelResult};

/// How long to wait for the gateway's registration ack.
const ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

type Writer = Arc<FrameWriter<OwnedWriteHalf>>;

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// Gateway tunnel address, `host:port`
    pub gateway_addr: String,
    /// This provider's peer id
    pub peer_id: String,
    /// Base domain used to predict public URLs
    pub base_domain: String,
}

pub struct TunnelClient {
    config: TunnelClientConfig,
    writer: Mutex<Option<Writer>>,
    /// deployment id → container-local port
    routes: Mutex<HashMap<String, u16>>,
    /// deployment id → registration ack slot (None = success)
    acks: Mutex<HashMap<String, oneshot::Sender<Option<String>>>>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl TunnelClient {
    pub fn new(config: TunnelClientConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(TunnelClient {
            config,
            writer: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
            cancel,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.writer.lock().expect("tunnel client lock poisoned").is_some()
    }

    /// Spawn the connection-maintenance loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match TcpStream::connect(&self.config.gateway_addr).await {
                Ok(conn) => {
                    info!(gateway = %self.config.gateway_addr, "Tunnel connected");
                    backoff = RECONNECT_BASE;
                    self.serve_connection(conn).await;
                    warn!("Tunnel disconnected");
                }
                Err(e) => {
                    debug!(gateway = %self.config.gateway_addr, error = %e, "Tunnel connect failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    /// Drive one established connection until it drops.
    async fn serve_connection(self: &Arc<Self>, conn: TcpStream) {
        let (read_half, write_half) = conn.into_split();
        let writer: Writer = Arc::new(FrameWriter::new(write_half));
        *self.writer.lock().expect("tunnel client lock poisoned") = Some(writer.clone());

        // Every currently-exposed deployment re-registers under its
        // original deterministic label.
        let routes: Vec<(String, u16)> = {
            let routes = self.routes.lock().expect("tunnel client lock poisoned");
            routes.iter().map(|(id, port)| (id.clone(), *port)).collect()
        };
        for (deployment_id, port) in routes {
            let frame = TunnelFrame::Register {
                deployment_id: deployment_id.clone(),
                port,
                peer_id: self.config.peer_id.clone(),
            };
            if let Err(e) = writer.send(&frame).await {
                warn!(deployment = %deployment_id, error = %e, "Re-registration failed");
            }
        }

        let mut lines = BufReader::new(read_half).lines();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if writer.send(&TunnelFrame::Heartbeat).await.is_err() {
                        break;
                    }
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) | Err(_) => break,
                    };
                    let frame = match TunnelFrame::from_line(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Invalid frame from gateway, ignoring");
                            continue;
                        }
                    };
                    self.dispatch(frame, &writer);
                }
            }
        }

        *self.writer.lock().expect("tunnel client lock poisoned") = None;
    }

    fn dispatch(self: &Arc<Self>, frame: TunnelFrame, writer: &Writer) {
        match frame {
            TunnelFrame::Registered {
                deployment_id,
                error,
            } => {
                let slot = self
                    .acks
                    .lock()
                    .expect("tunnel client lock poisoned")
                    .remove(&deployment_id);
                match (slot, error) {
                    (Some(tx), outcome) => {
                        let _ = tx.send(outcome);
                    }
                    (None, Some(e)) => {
                        warn!(deployment = %deployment_id, error = %e, "Re-registration rejected")
                    }
                    (None, None) => {
                        debug!(deployment = %deployment_id, "Registration confirmed")
                    }
                }
            }
            TunnelFrame::Request {
                request_id,
                deployment_id,
                method,
                path,
                headers,
                body,
            } => {
                let client = self.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let response = client
                        .replay_locally(&deployment_id, &method, &path, headers, body)
                        .await;
                    let frame = TunnelFrame::Response {
                        request_id,
                        status_code: response.0,
                        headers: response.1,
                        body: response.2,
                    };
                    if let Err(e) = writer.send(&frame).await {
                        debug!(error = %e, "Failed to write response frame");
                    }
                });
            }
            other => {
                debug!(frame = ?other, "Unexpected frame direction, ignoring");
            }
        }
    }

    /// Replay one tunneled request against the container's loopback port.
    async fn replay_locally(
        &self,
        deployment_id: &str,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> (u16, HashMap<String, String>, Vec<u8>) {
        let port = {
            let routes = self.routes.lock().expect("tunnel client lock poisoned");
            routes.get(deployment_id).copied()
        };
        let Some(port) = port else {
            return (404, HashMap::new(), b"deployment not found".to_vec());
        };

        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return (400, HashMap::new(), b"bad method".to_vec()),
        };
        let url = format!("http://127.0.0.1:{port}{path}");

        let mut header_map = HeaderMap::new();
        for (key, value) in &headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                header_map.insert(name, value);
            }
        }

        let result = self
            .http
            .request(method, &url)
            .headers(header_map)
            .body(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let mut headers = HashMap::new();
                for (name, value) in response.headers() {
                    if let Ok(value) = value.to_str() {
                        headers.insert(name.to_string(), value.to_string());
                    }
                }
                let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                (status, headers, body)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Local replay failed");
                (
                    502,
                    HashMap::new(),
                    format!("failed to reach container: {e}").into_bytes(),
                )
            }
        }
    }

    /// Expose a deployment through the tunnel; returns its public URL.
    pub async fn register_deployment(
        &self,
        deployment_id: &str,
        port: u16,
    ) -> TunnelResult<String> {
        let writer = self
            .writer
            .lock()
            .expect("tunnel client lock poisoned")
            .clone()
            .ok_or(TunnelError::NotConnected)?;

        self.routes
            .lock()
            .expect("tunnel client lock poisoned")
            .insert(deployment_id.to_string(), port);

        let (tx, rx) = oneshot::channel();
        self.acks
            .lock()
            .expect("tunnel client lock poisoned")
            .insert(deployment_id.to_string(), tx);

        let frame = TunnelFrame::Register {
            deployment_id: deployment_id.to_string(),
            port,
            peer_id: self.config.peer_id.clone(),
        };
        if let Err(e) = writer.send(&frame).await {
            self.acks
                .lock()
                .expect("tunnel client lock poisoned")
                .remove(deployment_id);
            self.routes
                .lock()
                .expect("tunnel client lock poisoned")
                .remove(deployment_id);
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(None)) => Ok(public_url(deployment_id, &self.config.base_domain)),
            Ok(Ok(Some(message))) => {
                self.routes
                    .lock()
                    .expect("tunnel client lock poisoned")
                    .remove(deployment_id);
                Err(TunnelError::Rejected(message))
            }
            Ok(Err(_)) => Err(TunnelError::TunnelGone),
            Err(_) => {
                // The label is deterministic, so the URL is still valid if
                // the ack is merely delayed; the route stays for reconnect.
                self.acks
                    .lock()
                    .expect("tunnel client lock poisoned")
                    .remove(deployment_id);
                warn!(deployment = %deployment_id, "Registration ack timed out");
                Ok(public_url(deployment_id, &self.config.base_domain))
            }
        }
    }

    /// Withdraw a deployment from the tunnel.
    pub async fn unregister_deployment(&self, deployment_id: &str) -> TunnelResult<()> {
        self.routes
            .lock()
            .expect("tunnel client lock poisoned")
            .remove(deployment_id);

        let writer = self
            .writer
            .lock()
            .expect("tunnel client lock poisoned")
            .clone();
        if let Some(writer) = writer {
            writer
                .send(&TunnelFrame::Unregister {
                    deployment_id: deployment_id.to_string(),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::subdomain_label;
    use crate::server::TunnelManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server standing in for a container.
    async fn start_container_stub() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = conn.read(&mut buf).await;
                    let body = "hello from container";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nx-served-by: stub\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_public_request_reaches_container_and_back() {
        // Gateway side
        let manager = TunnelManager::new("tunnel.test");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(manager.clone().run_listener(listener, cancel.clone()));

        // Container stand-in
        let (container_port, _stub) = start_container_stub().await;

        // Provider side
        let client = TunnelClient::new(
            TunnelClientConfig {
                gateway_addr: gateway_addr.to_string(),
                peer_id: "peer-a".into(),
                base_domain: "tunnel.test".into(),
            },
            cancel.clone(),
        );
        client.spawn();

        // Wait for the tunnel to come up
        for _ in 0..200 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(client.is_connected());

        let url = client
            .register_deployment("dep-e2e", container_port)
            .await
            .unwrap();
        let label = subdomain_label("dep-e2e");
        assert_eq!(url, format!("https://{label}.tunnel.test"));

        let parts = manager
            .forward(&label, "GET", "/", HashMap::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(parts.status_code, 200);
        assert_eq!(parts.body, b"hello from container");
        assert_eq!(
            parts.headers.get("x-served-by").map(String::as_str),
            Some("stub")
        );

        // Unregister withdraws the route
        client.unregister_deployment("dep-e2e").await.unwrap();
        for _ in 0..100 {
            if manager.route_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(manager.route_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_register_requires_connection() {
        let client = TunnelClient::new(
            TunnelClientConfig {
                gateway_addr: "127.0.0.1:1".into(),
                peer_id: "peer-a".into(),
                base_domain: "tunnel.test".into(),
            },
            CancellationToken::new(),
        );
        let result = client.register_deployment("dep-1", 8080).await;
        assert!(matches!(result, Err(TunnelError::NotConnected)));
    }

    #[tokio::test]
    async fn test_request_for_unknown_route_gets_404() {
        let manager = TunnelManager::new("tunnel.test");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(manager.clone().run_listener(listener, cancel.clone()));

        let client = TunnelClient::new(
            TunnelClientConfig {
                gateway_addr: gateway_addr.to_string(),
                peer_id: "peer-a".into(),
                base_domain: "tunnel.test".into(),
            },
            cancel.clone(),
        );
        client.spawn();
        for _ in 0..200 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let url = client.register_deployment("dep-x", 1).await.unwrap();
        assert!(url.starts_with("https://"));

        // Drop the route on the provider only; the gateway still forwards,
        // and the provider answers 404 for the unknown deployment.
        client
            .routes
            .lock()
            .unwrap()
            .remove("dep-x");

        let parts = manager
            .forward(
                &subdomain_label("dep-x"),
                "GET",
                "/",
                HashMap::new(),
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(parts.status_code, 404);
        cancel.cancel();
    }
}
