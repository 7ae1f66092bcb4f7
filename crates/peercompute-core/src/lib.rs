//! Core types for Peer Compute.
//!
//! This crate holds everything both sides of the wire agree on: peer
//! identities, protocol messages, the framed encoding used on peer-to-peer
//! streams, and the canonical signing scheme for deployment and stop
//! requests. It performs no I/O beyond identity persistence.

pub mod b64;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod signing;

pub use error::{CoreError, CoreResult};
pub use identity::{Identity, PeerId};
