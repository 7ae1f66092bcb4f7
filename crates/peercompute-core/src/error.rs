//! Core error types

use thiserror::Error;

/// Errors produced by framing, signing, and identity handling.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unknown frame tag: {0}")]
    UnknownTag(u8),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("request timestamp outside allowed window: drift {0}s")]
    StaleTimestamp(i64),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
