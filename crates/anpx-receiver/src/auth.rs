//! DID-WBA Authorization header construction.
//!
//! The signature covers the SHA-256 of the canonical JSON object
//! `{"did":..,"nonce":..,"service":<domain>,"timestamp":..}` — this must
//! match the gateway's verifier byte for byte.

use crate::error::{ReceiverError, ReceiverResult};
use ed25519_dalek::{Signer, SigningKey};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Load an ed25519 signing key from a hex-encoded 32-byte seed file.
pub fn load_signing_key(path: &Path) -> ReceiverResult<SigningKey> {
    let hex_text = std::fs::read_to_string(path)
        .map_err(|e| ReceiverError::Config(format!("cannot read {}: {e}", path.display())))?;
    let seed: [u8; 32] = hex::decode(hex_text.trim())
        .map_err(|e| ReceiverError::Config(format!("{}: bad hex: {e}", path.display())))?
        .try_into()
        .map_err(|_| ReceiverError::Config(format!("{}: seed must be 32 bytes", path.display())))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// SHA-256 digest of the canonical signing payload.
fn signing_payload(did: &str, nonce: &str, timestamp: u64, domain: &str) -> [u8; 32] {
    let canonical = serde_json::json!({
        "did": did,
        "nonce": nonce,
        "service": domain,
        "timestamp": timestamp,
    });
    let bytes = serde_json::to_vec(&canonical).expect("static JSON");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Extract the effective domain from the gateway URL (host without port).
pub fn domain_of(gateway_url: &str) -> String {
    let rest = gateway_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(gateway_url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    authority
        .split(':')
        .next()
        .unwrap_or(authority)
        .to_ascii_lowercase()
}

/// Build the `Authorization` header value for a tunnel handshake.
///
/// Each call uses a fresh random nonce; the gateway's one-shot nonce cache
/// rejects replays, so reconnects must re-sign.
pub fn build_authorization(
    did: &str,
    verification_method: &str,
    key: &SigningKey,
    gateway_url: &str,
) -> String {
    let nonce: String = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let domain = domain_of(gateway_url);

    let payload = signing_payload(did, &nonce, timestamp, &domain);
    let signature = key.sign(&payload);

    format!(
        "DIDWba did=\"{did}\", nonce=\"{nonce}\", timestamp=\"{timestamp}\", \
         verification_method=\"{verification_method}\", signature=\"{}\"",
        hex::encode(signature.to_bytes())
    )
}
