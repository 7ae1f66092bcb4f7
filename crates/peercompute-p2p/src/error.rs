//! P2P error types

use peercompute_core::{CoreError, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("peer {0} is not trusted")]
    Untrusted(PeerId),

    #[error("peer {0} is not in the trust store")]
    UnknownPeer(PeerId),

    #[error("no reachable address for peer {0}")]
    NoAddress(PeerId),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type P2pResult<T> = Result<T, P2pError>;
