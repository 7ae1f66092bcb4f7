//! Cryptographic identity management.
//!
//! Every peer owns a long-term Ed25519 signing key. The peer id is the
//! sha2-256 multihash of the verification key, hex-encoded, so it can be
//! re-derived by anyone holding the key but reveals nothing else. The
//! signing key never leaves this module; callers only get `sign`.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Filename for the persisted signing key inside the data directory
pub const KEY_FILE_NAME: &str = "identity.key";

/// Default data directory name under the user's home
pub const DATA_DIR_NAME: &str = ".peercompute";

const KEY_FILE_MODE: u32 = 0o600;
const DATA_DIR_MODE: u32 = 0o700;

/// Multihash code and length prefix for sha2-256
const MULTIHASH_SHA256: [u8; 2] = [0x12, 0x20];

/// Public identifier of a peer: the hex-encoded sha2-256 multihash of its
/// Ed25519 verification key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id for a verification key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = Vec::with_capacity(2 + digest.len());
        bytes.extend_from_slice(&MULTIHASH_SHA256);
        bytes.extend_from_slice(&digest);
        PeerId(hex::encode(bytes))
    }

    /// Parse a textual peer id, validating shape and multihash prefix.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidPeerId(s.to_string()))?;
        if bytes.len() != 34 || bytes[..2] != MULTIHASH_SHA256 {
            return Err(CoreError::InvalidPeerId(s.to_string()));
        }
        Ok(PeerId(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer's long-term cryptographic identity.
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a fresh Ed25519 identity.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let peer_id = PeerId::from_verifying_key(&signing_key.verifying_key());
        Identity {
            signing_key,
            peer_id,
        }
    }

    /// Load an identity from a key file holding the hex-encoded secret.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let encoded = fs::read_to_string(path)?;
        let raw = hex::decode(encoded.trim())
            .map_err(|e| CoreError::InvalidKey(format!("key file is not hex: {e}")))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidKey(format!("expected 32 key bytes, got {}", raw.len())))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let peer_id = PeerId::from_verifying_key(&signing_key.verifying_key());
        Ok(Identity {
            signing_key,
            peer_id,
        })
    }

    /// Persist the identity. The key file is owner-read-only, the directory
    /// owner-only.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(DATA_DIR_MODE)
                    .create(dir)?;
            }
        }
        let encoded = hex::encode(self.signing_key.to_bytes());
        fs::write(path, encoded)?;
        fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
        Ok(())
    }

    /// Load the identity at `path`, generating and persisting a new one if
    /// the file does not exist. Returns whether a new identity was created.
    pub fn load_or_generate(path: &Path) -> CoreResult<(Self, bool)> {
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok((identity, true))
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign arbitrary bytes with the long-term key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Resolve the data directory: `PEERCOMPUTE_DATA_DIR` if set, otherwise
/// `~/.peercompute`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PEERCOMPUTE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(DATA_DIR_NAME),
        Err(_) => PathBuf::from(DATA_DIR_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_round_trip() {
        let identity = Identity::generate();
        let id = identity.peer_id().clone();
        let parsed = PeerId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_peer_id_rejects_garbage() {
        assert!(PeerId::parse("not-hex").is_err());
        assert!(PeerId::parse("abcd").is_err());
        // Valid hex, wrong multihash prefix
        let bogus = format!("ff20{}", "00".repeat(32));
        assert!(PeerId::parse(&bogus).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(KEY_FILE_NAME);

        let identity = Identity::generate();
        identity.save(&path).unwrap();

        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);

        let (first, created) = Identity::load_or_generate(&path).unwrap();
        assert!(created);
        let (second, created) = Identity::load_or_generate(&path).unwrap();
        assert!(!created);
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_signature_verifies_under_verifying_key() {
        use ed25519_dalek::Verifier;

        let identity = Identity::generate();
        let sig = identity.sign(b"payload");
        assert!(identity.verifying_key().verify(b"payload", &sig).is_ok());
        assert!(identity.verifying_key().verify(b"tampered", &sig).is_err());
    }
}
