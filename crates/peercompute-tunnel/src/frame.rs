//! Tunnel wire frames.
//!
//! The tunnel carries newline-delimited JSON, one frame per line. Bodies are
//! base64 strings. The subdomain label routing a deployment is deterministic
//! from its id, so a reconnecting provider re-registers under the same
//! public URL.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::TunnelResult;

/// Heartbeat period on the provider side.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// How long the gateway waits for a response frame before giving up.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Reconnect back-off: base, doubling, capped.
pub const RECONNECT_BASE: std::time::Duration = std::time::Duration::from_secs(5);
pub const RECONNECT_CAP: std::time::Duration = std::time::Duration::from_secs(60);

/// A tunnel is considered healthy if it heartbeated within this window.
pub const HEALTH_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

const LABEL_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    /// provider → gateway: expose a deployment
    Register {
        deployment_id: String,
        port: u16,
        peer_id: String,
    },
    /// gateway → provider: registration outcome
    Registered {
        deployment_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// provider → gateway: withdraw a deployment
    Unregister { deployment_id: String },
    /// gateway → provider: an inbound public HTTP request
    Request {
        request_id: String,
        deployment_id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(with = "peercompute_core::b64", default, skip_serializing_if = "Vec::is_empty")]
        body: Vec<u8>,
    },
    /// provider → gateway: the correlated response
    Response {
        request_id: String,
        status_code: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(with = "peercompute_core::b64", default, skip_serializing_if = "Vec::is_empty")]
        body: Vec<u8>,
    },
    /// provider → gateway: liveness signal
    Heartbeat,
}

impl TunnelFrame {
    pub fn to_line(&self) -> TunnelResult<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> TunnelResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Derive the external route key for a deployment: the first 12 hex
/// characters of sha2-256 of its id.
pub fn subdomain_label(deployment_id: &str) -> String {
    let digest = Sha256::digest(deployment_id.as_bytes());
    hex::encode(digest)[..LABEL_LEN].to_string()
}

/// Public URL for a deployment under the gateway's base domain.
pub fn public_url(deployment_id: &str, base_domain: &str) -> String {
    format!("https://{}.{}", subdomain_label(deployment_id), base_domain)
}

/// Serialized write half of a tunnel connection. Frames from concurrent
/// tasks interleave at line granularity only.
pub struct FrameWriter<W> {
    inner: Mutex<BufWriter<W>>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        FrameWriter {
            inner: Mutex::new(BufWriter::new(writer)),
        }
    }

    pub async fn send(&self, frame: &TunnelFrame) -> TunnelResult<()> {
        let line = frame.to_line()?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_deterministic_and_short() {
        let a = subdomain_label("dep-1700000000000000000-0");
        let b = subdomain_label("dep-1700000000000000000-0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = subdomain_label("dep-1700000000000000000-1");
        assert_ne!(a, other);
    }

    #[test]
    fn test_frame_line_round_trip() {
        let frame = TunnelFrame::Request {
            request_id: "42".into(),
            deployment_id: "dep-1".into(),
            method: "POST".into(),
            path: "/api?x=1".into(),
            headers: HashMap::from([("Content-Type".into(), "text/plain".into())]),
            body: b"hello".to_vec(),
        };
        let line = frame.to_line().unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');

        let text = std::str::from_utf8(&line).unwrap().trim_end();
        let parsed = TunnelFrame::from_line(text).unwrap();
        match parsed {
            TunnelFrame::Request {
                request_id, body, ..
            } => {
                assert_eq!(request_id, "42");
                assert_eq!(body, b"hello");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_body_travels_as_base64() {
        let frame = TunnelFrame::Response {
            request_id: "1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body: vec![0xde, 0xad],
        };
        let line = String::from_utf8(frame.to_line().unwrap()).unwrap();
        assert!(line.contains("\"3q0=\""));
    }

    #[test]
    fn test_heartbeat_is_tiny() {
        let line = TunnelFrame::Heartbeat.to_line().unwrap();
        let parsed = TunnelFrame::from_line(std::str::from_utf8(&line).unwrap().trim()).unwrap();
        assert!(matches!(parsed, TunnelFrame::Heartbeat));
    }
}
