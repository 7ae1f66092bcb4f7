//! Reverse-tunnel multiplexer.
//!
//! Providers hold one long-lived outbound TCP connection to the gateway.
//! Every exposed deployment of that provider shares the connection: the
//! gateway demultiplexes concurrent inbound HTTP requests onto it as
//! `request` frames and correlates `response` frames back to waiting public
//! clients by request id.

pub mod client;
pub mod frame;
pub mod server;

use thiserror::Error;

pub use client::TunnelClient;
pub use frame::{subdomain_label, TunnelFrame};
pub use server::{ResponseParts, TunnelManager};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no route for label {0}")]
    NotFound(String),

    #[error("subdomain label {0} is already routed")]
    RouteConflict(String),

    #[error("tunnel disconnected")]
    TunnelGone,

    #[error("tunnel request timed out")]
    Timeout,

    #[error("not connected to gateway")]
    NotConnected,

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("malformed tunnel frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
