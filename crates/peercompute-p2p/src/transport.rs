//! Noise-secured streams with identity binding.
//!
//! Each connection runs a Noise XX handshake (25519/ChaChaPoly/SHA256) with
//! a fresh static key. The handshake payload carries the sender's Ed25519
//! verification key and a signature over its Noise static public key, so the
//! proven peer id is bound to the long-term identity while session secrecy
//! comes from the ephemeral exchange. Transport-phase messages are 2-byte
//! big-endian length-prefixed Noise ciphertexts; frame payloads larger than
//! one Noise message are chunked transparently.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use peercompute_core::codec::{encode_frame, Frame, FrameDecoder};
use peercompute_core::message::MessageType;
use peercompute_core::{Identity, PeerId};

use crate::error::{P2pError, P2pResult};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const MAX_NOISE_MESSAGE: usize = 65535;
/// Leave headroom for the 16-byte AEAD tag.
const MAX_PLAINTEXT_CHUNK: usize = 65000;

/// Handshake payload binding the Noise static key to the long-term identity.
#[derive(Serialize, Deserialize)]
struct IdentityProof {
    /// Hex-encoded Ed25519 verification key
    identity_key: String,
    /// Hex-encoded signature over the sender's Noise static public key
    signature: String,
}

fn identity_proof(identity: &Identity, noise_static_pub: &[u8]) -> P2pResult<Vec<u8>> {
    let proof = IdentityProof {
        identity_key: hex::encode(identity.verifying_key().as_bytes()),
        signature: hex::encode(identity.sign(noise_static_pub).to_bytes()),
    };
    serde_json::to_vec(&proof)
        .map_err(|e| P2pError::Handshake(format!("failed to encode identity proof: {e}")))
}

fn verify_proof(payload: &[u8], remote_static: &[u8]) -> P2pResult<(VerifyingKey, PeerId)> {
    let proof: IdentityProof = serde_json::from_slice(payload)
        .map_err(|e| P2pError::Handshake(format!("malformed identity proof: {e}")))?;

    let key_bytes = hex::decode(&proof.identity_key)
        .map_err(|_| P2pError::Handshake("identity key is not hex".into()))?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| P2pError::Handshake("identity key has wrong length".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| P2pError::Handshake("invalid identity key".into()))?;

    let sig_bytes = hex::decode(&proof.signature)
        .map_err(|_| P2pError::Handshake("signature is not hex".into()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|_| P2pError::Handshake("invalid signature encoding".into()))?;

    key.verify(remote_static, &sig)
        .map_err(|_| P2pError::Handshake("identity does not own the session key".into()))?;

    let peer = PeerId::from_verifying_key(&key);
    Ok((key, peer))
}

async fn send_handshake(io: &mut TcpStream, msg: &[u8]) -> P2pResult<()> {
    io.write_all(&(msg.len() as u16).to_be_bytes()).await?;
    io.write_all(msg).await?;
    io.flush().await?;
    Ok(())
}

async fn recv_handshake(io: &mut TcpStream) -> P2pResult<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    io.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut msg = vec![0u8; len];
    io.read_exact(&mut msg).await.map_err(map_eof)?;
    Ok(msg)
}

fn map_eof(err: std::io::Error) -> P2pError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        P2pError::ConnectionClosed
    } else {
        P2pError::Io(err)
    }
}

/// An authenticated, encrypted stream to a proven peer.
pub struct SecureStream {
    io: TcpStream,
    noise: snow::TransportState,
    decoder: FrameDecoder,
    remote_peer: PeerId,
    remote_identity: VerifyingKey,
}

impl SecureStream {
    /// Run the handshake as the dialing side.
    pub async fn connect(mut io: TcpStream, identity: &Identity) -> P2pResult<Self> {
        let params: snow::params::NoiseParams = NOISE_PARAMS
            .parse()
            .map_err(|_| P2pError::Handshake("bad noise parameters".into()))?;
        let builder = snow::Builder::new(params);
        let keypair = builder.generate_keypair()?;
        let mut hs = builder
            .local_private_key(&keypair.private)
            .build_initiator()?;

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];

        // -> e
        let len = hs.write_message(&[], &mut buf)?;
        send_handshake(&mut io, &buf[..len]).await?;

        // <- e, ee, s, es + responder identity proof
        let msg = recv_handshake(&mut io).await?;
        let n = hs.read_message(&msg, &mut payload)?;
        let remote_static = hs
            .get_remote_static()
            .ok_or_else(|| P2pError::Handshake("responder sent no static key".into()))?
            .to_vec();
        let (remote_identity, remote_peer) = verify_proof(&payload[..n], &remote_static)?;

        // -> s, se + our identity proof
        let proof = identity_proof(identity, &keypair.public)?;
        let len = hs.write_message(&proof, &mut buf)?;
        send_handshake(&mut io, &buf[..len]).await?;

        Ok(SecureStream {
            io,
            noise: hs.into_transport_mode()?,
            decoder: FrameDecoder::new(),
            remote_peer,
            remote_identity,
        })
    }

    /// Run the handshake as the accepting side.
    pub async fn accept(mut io: TcpStream, identity: &Identity) -> P2pResult<Self> {
        let params: snow::params::NoiseParams = NOISE_PARAMS
            .parse()
            .map_err(|_| P2pError::Handshake("bad noise parameters".into()))?;
        let builder = snow::Builder::new(params);
        let keypair = builder.generate_keypair()?;
        let mut hs = builder
            .local_private_key(&keypair.private)
            .build_responder()?;

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];

        // <- e
        let msg = recv_handshake(&mut io).await?;
        hs.read_message(&msg, &mut payload)?;

        // -> e, ee, s, es + our identity proof
        let proof = identity_proof(identity, &keypair.public)?;
        let len = hs.write_message(&proof, &mut buf)?;
        send_handshake(&mut io, &buf[..len]).await?;

        // <- s, se + initiator identity proof
        let msg = recv_handshake(&mut io).await?;
        let n = hs.read_message(&msg, &mut payload)?;
        let remote_static = hs
            .get_remote_static()
            .ok_or_else(|| P2pError::Handshake("initiator sent no static key".into()))?
            .to_vec();
        let (remote_identity, remote_peer) = verify_proof(&payload[..n], &remote_static)?;

        Ok(SecureStream {
            io,
            noise: hs.into_transport_mode()?,
            decoder: FrameDecoder::new(),
            remote_peer,
            remote_identity,
        })
    }

    /// The peer id proven by the handshake.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// The Ed25519 key proven by the handshake, used to verify signed
    /// requests arriving on this stream.
    pub fn remote_identity(&self) -> &VerifyingKey {
        &self.remote_identity
    }

    /// Encode and send one frame.
    pub async fn send_frame<T: Serialize>(&mut self, tag: MessageType, msg: &T) -> P2pResult<()> {
        let bytes = encode_frame(tag, msg)?;
        self.write_plaintext(&bytes).await
    }

    /// Receive the next frame, or fail with `ConnectionClosed` on EOF.
    pub async fn recv_frame(&mut self) -> P2pResult<Frame> {
        match self.try_recv_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(P2pError::ConnectionClosed),
        }
    }

    /// Receive the next frame, or `None` on clean end-of-stream. Used by
    /// log consumers, where the remote closing the stream ends the feed.
    pub async fn try_recv_frame(&mut self) -> P2pResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            match self.recv_plaintext().await {
                Ok(plain) => self.decoder.push(&plain),
                Err(P2pError::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Half-close the write side, signalling end-of-stream to the peer.
    pub async fn close(&mut self) -> P2pResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    async fn write_plaintext(&mut self, data: &[u8]) -> P2pResult<()> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        for chunk in data.chunks(MAX_PLAINTEXT_CHUNK) {
            let len = self.noise.write_message(chunk, &mut buf)?;
            self.io.write_all(&(len as u16).to_be_bytes()).await?;
            self.io.write_all(&buf[..len]).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    async fn recv_plaintext(&mut self) -> P2pResult<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.io.read_exact(&mut len_buf).await.map_err(map_eof)?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut ciphertext = vec![0u8; len];
        self.io.read_exact(&mut ciphertext).await.map_err(map_eof)?;

        let mut plain = vec![0u8; len];
        let n = self.noise.read_message(&ciphertext, &mut plain)?;
        plain.truncate(n);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercompute_core::message::StatusRequest;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_proves_both_identities() {
        let server_id = std::sync::Arc::new(Identity::generate());
        let client_id = Identity::generate();
        let server_peer = server_id.peer_id().clone();
        let client_peer = client_id.peer_id().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_id = server_id.clone();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            SecureStream::accept(conn, &accept_id).await.unwrap()
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let client_stream = SecureStream::connect(conn, &client_id).await.unwrap();
        let server_stream = server.await.unwrap();

        assert_eq!(client_stream.remote_peer(), &server_peer);
        assert_eq!(server_stream.remote_peer(), &client_peer);
    }

    #[tokio::test]
    async fn test_frames_cross_the_secured_stream() {
        let server_id = std::sync::Arc::new(Identity::generate());
        let client_id = Identity::generate();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_id = server_id.clone();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut stream = SecureStream::accept(conn, &accept_id).await.unwrap();
            let frame = stream.recv_frame().await.unwrap();
            assert_eq!(frame.tag, MessageType::StatusRequest);
            let req: StatusRequest = frame.decode().unwrap();
            assert_eq!(req.deployment_id.as_deref(), Some("dep-42"));
            stream
                .send_frame(
                    MessageType::StatusRequest,
                    &StatusRequest {
                        deployment_id: Some("ack".into()),
                    },
                )
                .await
                .unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let mut stream = SecureStream::connect(conn, &client_id).await.unwrap();
        stream
            .send_frame(
                MessageType::StatusRequest,
                &StatusRequest {
                    deployment_id: Some("dep-42".into()),
                },
            )
            .await
            .unwrap();
        let reply = stream.recv_frame().await.unwrap();
        let req: StatusRequest = reply.decode().unwrap();
        assert_eq!(req.deployment_id.as_deref(), Some("ack"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_payload_chunks_across_noise_messages() {
        let server_id = std::sync::Arc::new(Identity::generate());
        let client_id = Identity::generate();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A log entry bigger than one noise message
        let big = vec![0xabu8; 200_000];
        let expected = big.clone();

        let accept_id = server_id.clone();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut stream = SecureStream::accept(conn, &accept_id).await.unwrap();
            let frame = stream.recv_frame().await.unwrap();
            let entry: peercompute_core::message::LogEntry = frame.decode().unwrap();
            assert_eq!(entry.data, expected);
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let mut stream = SecureStream::connect(conn, &client_id).await.unwrap();
        stream
            .send_frame(
                MessageType::LogEntry,
                &peercompute_core::message::LogEntry {
                    deployment_id: "dep-1".into(),
                    timestamp: 0,
                    stream: "stdout".into(),
                    data: big,
                },
            )
            .await
            .unwrap();

        server.await.unwrap();
    }
}
