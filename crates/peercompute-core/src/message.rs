//! Protocol messages exchanged between peers.
//!
//! All messages travel inside the framed encoding of [`crate::codec`]. Byte
//! fields are base64 strings on the wire; timestamps are unix nanoseconds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Maximum frame payload size (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// One-byte frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DeployRequest = 1,
    DeployResponse = 2,
    StopRequest = 3,
    StopResponse = 4,
    LogEntry = 5,
    StatusRequest = 6,
    StatusResponse = 7,
    LogsRequest = 8,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageType::DeployRequest),
            2 => Some(MessageType::DeployResponse),
            3 => Some(MessageType::StopRequest),
            4 => Some(MessageType::StopResponse),
            5 => Some(MessageType::LogEntry),
            6 => Some(MessageType::StatusRequest),
            7 => Some(MessageType::StatusResponse),
            8 => Some(MessageType::LogsRequest),
            _ => None,
        }
    }
}

/// Wire-level error kinds carried in typed error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    FramingError,
    AuthError,
    CapacitySlots,
    CapacityCpu,
    CapacityMemory,
    RuntimeError,
    NotFound,
    NotOwner,
    TunnelGone,
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::FramingError => "framing-error",
            ErrorKind::AuthError => "auth-error",
            ErrorKind::CapacitySlots => "capacity-slots",
            ErrorKind::CapacityCpu => "capacity-cpu",
            ErrorKind::CapacityMemory => "capacity-memory",
            ErrorKind::RuntimeError => "runtime-error",
            ErrorKind::NotFound => "not-found",
            ErrorKind::NotOwner => "not-owner",
            ErrorKind::TunnelGone => "tunnel-gone",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A typed error reply embedded in a response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorBody {
            kind,
            message: message.into(),
        }
    }
}

/// Signed request to deploy a container on a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub request_id: String,
    pub image: String,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    /// Container port to expose publicly (0 = not exposed)
    #[serde(default)]
    pub expose_port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub requester_id: PeerId,
    /// Unix nanoseconds at signing time
    pub timestamp: i64,
    #[serde(with = "crate::b64", default)]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Signed request to stop a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub deployment_id: String,
    pub requester_id: PeerId,
    pub timestamp: i64,
    #[serde(with = "crate::b64", default)]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Request to stream container logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsRequest {
    pub deployment_id: String,
    #[serde(default)]
    pub follow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<usize>,
}

/// One chunk of container log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub deployment_id: String,
    pub timestamp: i64,
    pub stream: String,
    #[serde(with = "crate::b64", default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Query one deployment, or all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    /// Present for single-deployment queries when the container is live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Point-in-time resource usage reported with a status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
}

/// Lifecycle state of a deployment. Progresses monotonically forward except
/// for jumps to the terminal states Failed and Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Pulling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped | DeploymentStatus::Failed | DeploymentStatus::Terminated
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Pulling => "pulling",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An admitted deployment on a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub requester_id: PeerId,
    pub status: DeploymentStatus,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    #[serde(default)]
    pub expose_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for tag in 1u8..=8 {
            let mt = MessageType::from_u8(tag).unwrap();
            assert_eq!(mt as u8, tag);
        }
        assert!(MessageType::from_u8(0).is_none());
        assert!(MessageType::from_u8(9).is_none());
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::CapacitySlots).unwrap();
        assert_eq!(json, "\"capacity-slots\"");
        let json = serde_json::to_string(&ErrorKind::TunnelGone).unwrap();
        assert_eq!(json, "\"tunnel-gone\"");
    }

    #[test]
    fn test_signature_encodes_as_base64() {
        let req = StopRequest {
            deployment_id: "dep-1".into(),
            requester_id: crate::Identity::generate().peer_id().clone(),
            timestamp: 42,
            signature: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["signature"], "3q2+7w==");
    }
}
