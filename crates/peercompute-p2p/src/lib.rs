//! Trust-gated peer-to-peer networking.
//!
//! Connections are plain TCP wrapped in a Noise XX handshake that binds the
//! session to each side's long-term Ed25519 identity. The connection gate
//! consults the trust store at every stage; no application frame crosses a
//! stream until the authenticated peer has been proven trusted.

pub mod client;
pub mod error;
pub mod gate;
pub mod host;
pub mod transport;
pub mod trust;

pub use client::PeerClient;
pub use error::{P2pError, P2pResult};
pub use gate::ConnectionGate;
pub use host::{Host, RequestHandler};
pub use transport::SecureStream;
pub use trust::{TrustStore, TrustedPeer};
