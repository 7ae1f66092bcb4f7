//! Protocol handlers.
//!
//! Each inbound stream carries exactly one request; the handler verifies
//! trust, signature, timestamp window, and request-id freshness before
//! touching the scheduler, replies exactly once (logs streams reply with a
//! sequence of frames), and closes the stream. Failures become typed error
//! responses; nothing leaks partial state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peercompute_core::codec::Frame;
use peercompute_core::message::{
    DeployRequest, DeployResponse, ErrorBody, ErrorKind, LogEntry, LogsRequest, MessageType,
    ResourceStats, StatusRequest, StatusResponse, StopRequest, StopResponse,
};
use peercompute_core::signing::{self, unix_nanos};
use peercompute_p2p::{RequestHandler, SecureStream, TrustStore};
use peercompute_runtime::RuntimePort;
use peercompute_scheduler::Scheduler;
use peercompute_tunnel::TunnelClient;

/// End-to-end deadline for a deploy request.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Request ids are remembered for this long to reject replays inside the
/// signature timestamp window.
const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct ProviderHandlers {
    scheduler: Arc<Scheduler>,
    runtime: Arc<dyn RuntimePort>,
    trust: Arc<TrustStore>,
    tunnel: Option<Arc<TunnelClient>>,
    seen_requests: Mutex<HashMap<String, Instant>>,
}

impl ProviderHandlers {
    pub fn new(
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn RuntimePort>,
        trust: Arc<TrustStore>,
        tunnel: Option<Arc<TunnelClient>>,
    ) -> Self {
        ProviderHandlers {
            scheduler,
            runtime,
            trust,
            tunnel,
            seen_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request id; false if it was already seen inside the window.
    fn record_request_id(&self, request_id: &str) -> bool {
        let mut seen = self.seen_requests.lock().expect("dedup lock poisoned");
        let now = Instant::now();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < DEDUP_WINDOW);
        if seen.contains_key(request_id) {
            return false;
        }
        seen.insert(request_id.to_string(), now);
        true
    }

    fn connected_tunnel(&self) -> Option<&Arc<TunnelClient>> {
        self.tunnel.as_ref().filter(|t| t.is_connected())
    }

    async fn handle_deploy(&self, stream: &mut SecureStream, frame: Frame) {
        let req: DeployRequest = match frame.decode() {
            Ok(req) => req,
            Err(e) => {
                let resp = deploy_error("", ErrorKind::FramingError, e.to_string());
                let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
                return;
            }
        };

        let peer = stream.remote_peer().clone();
        info!(peer = %peer, image = %req.image, cpu = req.cpu_millicores, memory = req.memory_bytes, "Deploy request");

        if req.requester_id != peer {
            let resp = deploy_error(
                &req.request_id,
                ErrorKind::AuthError,
                "requester id does not match authenticated peer",
            );
            let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
            return;
        }
        if !self.trust.is_trusted(&peer) {
            let resp = deploy_error(&req.request_id, ErrorKind::AuthError, "peer not trusted");
            let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
            return;
        }
        if let Err(e) = signing::verify_deploy(&req, stream.remote_identity(), Utc::now()) {
            warn!(peer = %peer, error = %e, "Deploy request failed verification");
            let resp = deploy_error(&req.request_id, ErrorKind::AuthError, e.to_string());
            let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
            return;
        }
        if !self.record_request_id(&req.request_id) {
            warn!(peer = %peer, request = %req.request_id, "Replayed request id rejected");
            let resp = deploy_error(
                &req.request_id,
                ErrorKind::AuthError,
                "request id already seen",
            );
            let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
            return;
        }

        // Run the schedule on its own task so a deadline here cannot leave
        // it half-finished; the token aborts an in-flight pull.
        let cancel = CancellationToken::new();
        let mut schedule = {
            let scheduler = self.scheduler.clone();
            let req = req.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.schedule(&req, cancel).await })
        };

        let result = tokio::select! {
            join = &mut schedule => match join {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(error = %join_err, "Schedule task panicked");
                    let resp = deploy_error(
                        &req.request_id,
                        ErrorKind::RuntimeError,
                        "internal scheduling failure",
                    );
                    let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
                    return;
                }
            },
            _ = tokio::time::sleep(DEPLOY_TIMEOUT) => {
                cancel.cancel();
                // If the deployment still comes up after the deadline, tear
                // it down so nothing is left running unreported.
                let scheduler = self.scheduler.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(deployment)) = schedule.await {
                        let _ = scheduler.stop(&deployment.id).await;
                    }
                });
                let resp = deploy_error(&req.request_id, ErrorKind::Timeout, "deploy timed out");
                let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
                return;
            }
        };

        let mut deployment = match result {
            Ok(deployment) => deployment,
            Err(e) => {
                let resp = deploy_error(&req.request_id, e.kind(), e.to_string());
                let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
                return;
            }
        };

        if req.expose_port > 0 {
            if let Some(tunnel) = self.connected_tunnel() {
                match tunnel
                    .register_deployment(&deployment.id, req.expose_port)
                    .await
                {
                    Ok(url) => {
                        self.scheduler.set_exposed_url(&deployment.id, url.clone());
                        deployment.exposed_url = Some(url);
                    }
                    Err(e) => {
                        warn!(deployment = %deployment.id, error = %e, "Gateway registration failed");
                    }
                }
            }
        }

        info!(deployment = %deployment.id, "Deploy succeeded");
        let resp = DeployResponse {
            request_id: req.request_id,
            deployment_id: Some(deployment.id),
            status: Some(deployment.status),
            container_id: deployment.container_id,
            exposed_url: deployment.exposed_url,
            error: None,
        };
        let _ = stream.send_frame(MessageType::DeployResponse, &resp).await;
    }

    async fn handle_stop(&self, stream: &mut SecureStream, frame: Frame) {
        let req: StopRequest = match frame.decode() {
            Ok(req) => req,
            Err(e) => {
                let resp = stop_error("", ErrorKind::FramingError, e.to_string());
                let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
                return;
            }
        };

        let peer = stream.remote_peer().clone();
        info!(peer = %peer, deployment = %req.deployment_id, "Stop request");

        if req.requester_id != peer || !self.trust.is_trusted(&peer) {
            let resp = stop_error(&req.deployment_id, ErrorKind::AuthError, "peer not authorized");
            let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
            return;
        }
        if let Err(e) = signing::verify_stop(&req, stream.remote_identity(), Utc::now()) {
            let resp = stop_error(&req.deployment_id, ErrorKind::AuthError, e.to_string());
            let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
            return;
        }

        let Some(deployment) = self.scheduler.get(&req.deployment_id) else {
            let resp = stop_error(&req.deployment_id, ErrorKind::NotFound, "unknown deployment");
            let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
            return;
        };
        // Only the peer that deployed it may stop it
        if deployment.requester_id != peer {
            let resp = stop_error(
                &req.deployment_id,
                ErrorKind::NotOwner,
                "deployment belongs to another requester",
            );
            let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
            return;
        }

        if deployment.expose_port > 0 {
            if let Some(tunnel) = self.connected_tunnel() {
                if let Err(e) = tunnel.unregister_deployment(&req.deployment_id).await {
                    warn!(deployment = %req.deployment_id, error = %e, "Tunnel unregister failed");
                }
            }
        }

        let resp = match self.scheduler.stop(&req.deployment_id).await {
            Ok(()) => StopResponse {
                deployment_id: req.deployment_id,
                error: None,
            },
            Err(e) => stop_error(&req.deployment_id, e.kind(), e.to_string()),
        };
        let _ = stream.send_frame(MessageType::StopResponse, &resp).await;
    }

    async fn handle_logs(&self, stream: &mut SecureStream, frame: Frame) {
        let req: LogsRequest = match frame.decode() {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "Malformed logs request");
                return;
            }
        };

        let peer = stream.remote_peer().clone();
        if !self.trust.is_trusted(&peer) {
            warn!(peer = %peer, "Logs request from untrusted peer");
            return;
        }

        let Some(deployment) = self.scheduler.get(&req.deployment_id) else {
            debug!(deployment = %req.deployment_id, "Logs for unknown deployment");
            return;
        };
        let Some(container_id) = deployment.container_id else {
            return;
        };

        let mut logs = match self
            .runtime
            .logs(&container_id, req.follow, req.tail)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(deployment = %req.deployment_id, error = %e, "Log stream failed");
                return;
            }
        };

        let mut buf = vec![0u8; 8192];
        loop {
            let n = match logs.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Log read ended");
                    break;
                }
            };
            let entry = LogEntry {
                deployment_id: req.deployment_id.clone(),
                timestamp: unix_nanos(Utc::now()),
                stream: "stdout".to_string(),
                data: buf[..n].to_vec(),
            };
            if stream.send_frame(MessageType::LogEntry, &entry).await.is_err() {
                break;
            }
        }
        logs.shutdown().await;
    }

    async fn handle_status(&self, stream: &mut SecureStream, frame: Frame) {
        let req: StatusRequest = match frame.decode() {
            Ok(req) => req,
            Err(e) => {
                let resp = StatusResponse {
                    deployments: Vec::new(),
                    resource_usage: None,
                    error: Some(ErrorBody::new(ErrorKind::FramingError, e.to_string())),
                };
                let _ = stream.send_frame(MessageType::StatusResponse, &resp).await;
                return;
            }
        };

        let peer = stream.remote_peer().clone();
        if !self.trust.is_trusted(&peer) {
            warn!(peer = %peer, "Status request from untrusted peer");
            let resp = StatusResponse {
                deployments: Vec::new(),
                resource_usage: None,
                error: Some(ErrorBody::new(ErrorKind::AuthError, "peer not trusted")),
            };
            let _ = stream.send_frame(MessageType::StatusResponse, &resp).await;
            return;
        }

        let resp = match req.deployment_id {
            Some(id) => match self.scheduler.get(&id) {
                Some(deployment) => {
                    let resource_usage = match &deployment.container_id {
                        Some(container) => {
                            self.runtime.stats(container).await.ok().map(|stats| {
                                ResourceStats {
                                    cpu_percent: stats.cpu_percent,
                                    memory_bytes: stats.memory_bytes,
                                    memory_limit: stats.memory_limit,
                                }
                            })
                        }
                        None => None,
                    };
                    StatusResponse {
                        deployments: vec![deployment],
                        resource_usage,
                        error: None,
                    }
                }
                None => StatusResponse {
                    deployments: Vec::new(),
                    resource_usage: None,
                    error: Some(ErrorBody::new(ErrorKind::NotFound, "unknown deployment")),
                },
            },
            None => StatusResponse {
                deployments: self.scheduler.list(),
                resource_usage: None,
                error: None,
            },
        };
        let _ = stream.send_frame(MessageType::StatusResponse, &resp).await;
    }
}

fn deploy_error(request_id: &str, kind: ErrorKind, message: impl Into<String>) -> DeployResponse {
    DeployResponse {
        request_id: request_id.to_string(),
        deployment_id: None,
        status: None,
        container_id: None,
        exposed_url: None,
        error: Some(ErrorBody::new(kind, message)),
    }
}

fn stop_error(deployment_id: &str, kind: ErrorKind, message: impl Into<String>) -> StopResponse {
    StopResponse {
        deployment_id: deployment_id.to_string(),
        error: Some(ErrorBody::new(kind, message)),
    }
}


#[async_trait]
impl RequestHandler for ProviderHandlers {
    async fn handle(&self, mut stream: SecureStream, frame: Frame) {
        match frame.tag {
            MessageType::DeployRequest => self.handle_deploy(&mut stream, frame).await,
            MessageType::StopRequest => self.handle_stop(&mut stream, frame).await,
            MessageType::LogsRequest => self.handle_logs(&mut stream, frame).await,
            MessageType::StatusRequest => self.handle_status(&mut stream, frame).await,
            other => {
                debug!(tag = ?other, peer = %stream.remote_peer(), "Unexpected request tag");
            }
        }
        let _ = stream.close().await;
    }
}
