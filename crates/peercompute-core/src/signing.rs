//! Canonical signing of deployment and stop requests.
//!
//! Signer and verifier must hash identical bytes, so the signed payload is a
//! key-ordered JSON object (serde_json's map is a BTreeMap, which keeps keys
//! sorted) with the signature field excluded, digested with SHA-256. The
//! Ed25519 signature is computed over the digest.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::identity::Identity;
use crate::message::{DeployRequest, StopRequest};

/// Maximum tolerated difference between a request timestamp and the
/// verifier's clock, in nanoseconds. Symmetric: future-dated requests are
/// rejected too.
pub const MAX_TIMESTAMP_DRIFT_NANOS: i64 = 5 * 60 * 1_000_000_000;

/// Current wall clock as unix nanoseconds.
pub fn unix_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt()
        .unwrap_or_else(|| t.timestamp_micros().saturating_mul(1_000))
}

fn deploy_digest(req: &DeployRequest) -> CoreResult<[u8; 32]> {
    let canonical = json!({
        "cpu_millicores": req.cpu_millicores,
        "environment": req.environment,
        "expose_port": req.expose_port,
        "image": req.image,
        "memory_bytes": req.memory_bytes,
        "request_id": req.request_id,
        "requester_id": req.requester_id,
        "timestamp": req.timestamp,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(Sha256::digest(&bytes).into())
}

fn stop_digest(req: &StopRequest) -> CoreResult<[u8; 32]> {
    let canonical = json!({
        "deployment_id": req.deployment_id,
        "requester_id": req.requester_id,
        "timestamp": req.timestamp,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Timestamp the request with `now` and sign it.
pub fn sign_deploy(req: &mut DeployRequest, identity: &Identity, now: DateTime<Utc>) -> CoreResult<()> {
    req.signature.clear();
    req.timestamp = unix_nanos(now);
    let digest = deploy_digest(req)?;
    req.signature = identity.sign(&digest).to_bytes().to_vec();
    Ok(())
}

/// Timestamp the request with `now` and sign it.
pub fn sign_stop(req: &mut StopRequest, identity: &Identity, now: DateTime<Utc>) -> CoreResult<()> {
    req.signature.clear();
    req.timestamp = unix_nanos(now);
    let digest = stop_digest(req)?;
    req.signature = identity.sign(&digest).to_bytes().to_vec();
    Ok(())
}

fn validate_timestamp(timestamp: i64, now: DateTime<Utc>) -> CoreResult<()> {
    let drift = unix_nanos(now) - timestamp;
    if drift.abs() > MAX_TIMESTAMP_DRIFT_NANOS {
        return Err(CoreError::StaleTimestamp(drift / 1_000_000_000));
    }
    Ok(())
}

/// Verify the signature and timestamp window of a deploy request against the
/// key proven by the transport handshake.
pub fn verify_deploy(req: &DeployRequest, key: &VerifyingKey, now: DateTime<Utc>) -> CoreResult<()> {
    validate_timestamp(req.timestamp, now)?;
    let digest = deploy_digest(req)?;
    let sig = Signature::from_slice(&req.signature).map_err(|_| CoreError::BadSignature)?;
    key.verify(&digest, &sig).map_err(|_| CoreError::BadSignature)
}

/// Verify the signature and timestamp window of a stop request.
pub fn verify_stop(req: &StopRequest, key: &VerifyingKey, now: DateTime<Utc>) -> CoreResult<()> {
    validate_timestamp(req.timestamp, now)?;
    let digest = stop_digest(req)?;
    let sig = Signature::from_slice(&req.signature).map_err(|_| CoreError::BadSignature)?;
    key.verify(&digest, &sig).map_err(|_| CoreError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn sample_request(identity: &Identity) -> DeployRequest {
        let mut environment = BTreeMap::new();
        environment.insert("PORT".to_string(), "80".to_string());
        DeployRequest {
            request_id: "req-1".into(),
            image: "nginx:alpine".into(),
            cpu_millicores: 500,
            memory_bytes: 256 * 1024 * 1024,
            expose_port: 80,
            environment,
            requester_id: identity.peer_id().clone(),
            timestamp: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let identity = Identity::generate();
        let now = Utc::now();
        let mut req = sample_request(&identity);
        sign_deploy(&mut req, &identity, now).unwrap();
        verify_deploy(&req, &identity.verifying_key(), now).unwrap();
    }

    #[test]
    fn test_mutated_field_breaks_signature() {
        let identity = Identity::generate();
        let now = Utc::now();
        let mut req = sample_request(&identity);
        sign_deploy(&mut req, &identity, now).unwrap();

        let mut tampered = req.clone();
        tampered.cpu_millicores = 4000;
        assert!(matches!(
            verify_deploy(&tampered, &identity.verifying_key(), now),
            Err(CoreError::BadSignature)
        ));

        let mut tampered = req.clone();
        tampered.image = "evil:latest".into();
        assert!(verify_deploy(&tampered, &identity.verifying_key(), now).is_err());

        let mut tampered = req;
        tampered
            .environment
            .insert("LD_PRELOAD".into(), "x".into());
        assert!(verify_deploy(&tampered, &identity.verifying_key(), now).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let now = Utc::now();
        let mut req = sample_request(&identity);
        sign_deploy(&mut req, &identity, now).unwrap();
        assert!(verify_deploy(&req, &other.verifying_key(), now).is_err());
    }

    #[test]
    fn test_timestamp_window_boundary() {
        let identity = Identity::generate();
        let signed_at = Utc::now();
        let mut req = sample_request(&identity);
        sign_deploy(&mut req, &identity, signed_at).unwrap();

        // Exactly five minutes old still verifies
        let at_limit = signed_at + Duration::minutes(5);
        verify_deploy(&req, &identity.verifying_key(), at_limit).unwrap();

        // One second past the window fails, in either direction
        let past = signed_at + Duration::minutes(5) + Duration::seconds(1);
        assert!(matches!(
            verify_deploy(&req, &identity.verifying_key(), past),
            Err(CoreError::StaleTimestamp(_))
        ));
        let future = signed_at - Duration::minutes(5) - Duration::seconds(1);
        assert!(verify_deploy(&req, &identity.verifying_key(), future).is_err());
    }

    #[test]
    fn test_stop_sign_verify() {
        let identity = Identity::generate();
        let now = Utc::now();
        let mut req = StopRequest {
            deployment_id: "dep-1".into(),
            requester_id: identity.peer_id().clone(),
            timestamp: 0,
            signature: Vec::new(),
        };
        sign_stop(&mut req, &identity, now).unwrap();
        verify_stop(&req, &identity.verifying_key(), now).unwrap();

        let mut tampered = req;
        tampered.deployment_id = "dep-2".into();
        assert!(verify_stop(&tampered, &identity.verifying_key(), now).is_err());
    }
}
