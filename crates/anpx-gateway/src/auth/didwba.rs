//! DID-WBA admission verification.
//!
//! The upgrade request carries `Authorization: DIDWba did="...",
//! nonce="...", timestamp="...", verification_method="...",
//! signature="<hex>"`. The signature covers the SHA-256 of the canonical
//! JSON object `{"did":..,"nonce":..,"service":<domain>,"timestamp":..}`
//! so a header captured for one gateway domain cannot be replayed against
//! another.

use crate::auth::nonce::NonceCache;
use crate::config::ReceiverEntry;
use crate::directory::DirFuture;
use crate::error::{GatewayError, GatewayResult};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const AUTH_SCHEME: &str = "DIDWba";

/// Parsed DID-WBA Authorization header.
#[derive(Debug, Clone)]
pub struct AuthHeader {
    pub did: String,
    pub nonce: String,
    pub timestamp: u64,
    pub verification_method: String,
    pub signature: Vec<u8>,
}

/// A resolved DID document, reduced to its verification methods.
#[derive(Debug, Clone)]
pub struct DidDocument {
    pub did: String,
    /// Verification method id → ed25519 key.
    pub keys: HashMap<String, VerifyingKey>,
}

/// DID document resolution. Production deployments resolve over the
/// network; tests and static deployments use [`StaticResolver`].
pub trait DidResolver: Send + Sync {
    fn resolve<'a>(&'a self, did: &'a str) -> DirFuture<'a, DidDocument>;
}

/// Resolver backed by the `[[receivers]]` config table.
pub struct StaticResolver {
    docs: HashMap<String, DidDocument>,
}

impl StaticResolver {
    pub fn from_entries(entries: &[ReceiverEntry]) -> GatewayResult<Self> {
        let mut docs: HashMap<String, DidDocument> = HashMap::new();
        for entry in entries {
            let key_bytes: [u8; 32] = hex::decode(&entry.public_key)
                .map_err(|e| GatewayError::Config(format!("{}: bad public_key: {e}", entry.did)))?
                .try_into()
                .map_err(|_| {
                    GatewayError::Config(format!("{}: public_key must be 32 bytes", entry.did))
                })?;
            let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| {
                GatewayError::Config(format!("{}: invalid ed25519 key: {e}", entry.did))
            })?;
            docs.entry(entry.did.clone())
                .or_insert_with(|| DidDocument {
                    did: entry.did.clone(),
                    keys: HashMap::new(),
                })
                .keys
                .insert(entry.verification_method.clone(), key);
        }
        Ok(Self { docs })
    }
}

impl DidResolver for StaticResolver {
    fn resolve<'a>(&'a self, did: &'a str) -> DirFuture<'a, DidDocument> {
        Box::pin(async move {
            self.docs
                .get(did)
                .cloned()
                .ok_or_else(|| GatewayError::TunnelAuth(format!("unknown DID {did}")))
        })
    }
}

/// Parse the Authorization header value.
pub fn parse_header(value: &str) -> GatewayResult<AuthHeader> {
    let rest = value
        .strip_prefix(AUTH_SCHEME)
        .ok_or_else(|| GatewayError::TunnelAuth("not a DIDWba Authorization header".into()))?
        .trim();

    let mut fields: HashMap<&str, String> = HashMap::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, raw) = part
            .split_once('=')
            .ok_or_else(|| GatewayError::TunnelAuth(format!("malformed field: {part}")))?;
        let value = raw.trim().trim_matches('"');
        fields.insert(key.trim(), value.to_string());
    }

    let take = |name: &str| -> GatewayResult<String> {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::TunnelAuth(format!("missing field: {name}")))
    };

    let timestamp = take("timestamp")?
        .parse::<u64>()
        .map_err(|_| GatewayError::TunnelAuth("timestamp is not an integer".into()))?;
    let signature = hex::decode(take("signature")?)
        .map_err(|_| GatewayError::TunnelAuth("signature is not hex".into()))?;

    Ok(AuthHeader {
        did: take("did")?,
        nonce: take("nonce")?,
        timestamp,
        verification_method: take("verification_method")?,
        signature,
    })
}

/// SHA-256 digest of the canonical signing payload. Must match the
/// receiver's header builder byte for byte.
pub fn signing_payload(did: &str, nonce: &str, timestamp: u64, domain: &str) -> [u8; 32] {
    let canonical = serde_json::json!({
        "did": did,
        "nonce": nonce,
        "service": domain,
        "timestamp": timestamp,
    });
    // serde_json sorts object keys, so this serialization is canonical.
    let bytes = serde_json::to_vec(&canonical).expect("static JSON");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Verifier wiring the resolver, nonce cache, and timestamp window.
pub struct DidWbaVerifier {
    resolver: Arc<dyn DidResolver>,
    nonces: Arc<NonceCache>,
    timestamp_window: Duration,
}

impl DidWbaVerifier {
    pub fn new(
        resolver: Arc<dyn DidResolver>,
        nonces: Arc<NonceCache>,
        timestamp_window: Duration,
    ) -> Self {
        Self {
            resolver,
            nonces,
            timestamp_window,
        }
    }

    /// Verify an Authorization header against the effective domain.
    /// Returns the authenticated DID.
    pub async fn verify(&self, header_value: &str, domain: &str) -> GatewayResult<String> {
        let header = parse_header(header_value)?;

        let now = unix_now();
        let skew = now.abs_diff(header.timestamp);
        if skew > self.timestamp_window.as_secs() {
            warn!(did = %header.did, skew, "timestamp outside window");
            return Err(GatewayError::TunnelAuth("timestamp outside window".into()));
        }

        if !self.nonces.try_use(&header.nonce) {
            warn!(did = %header.did, "nonce replay");
            return Err(GatewayError::TunnelAuth("nonce already used".into()));
        }

        let document = self.resolver.resolve(&header.did).await?;
        let key = document.keys.get(&header.verification_method).ok_or_else(|| {
            GatewayError::TunnelAuth(format!(
                "unknown verification method {}",
                header.verification_method
            ))
        })?;

        let signature = Signature::from_slice(&header.signature)
            .map_err(|_| GatewayError::TunnelAuth("malformed signature".into()))?;
        let payload = signing_payload(&header.did, &header.nonce, header.timestamp, domain);
        key.verify(&payload, &signature)
            .map_err(|_| GatewayError::TunnelAuth("signature verification failed".into()))?;

        debug!(did = %header.did, domain, "DID-WBA verified");
        Ok(header.did)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn receiver_entry(signing: &SigningKey) -> ReceiverEntry {
        ReceiverEntry {
            did: "did:wba:example.com:r1".into(),
            verification_method: "key-1".into(),
            public_key: hex::encode(signing.verifying_key().to_bytes()),
            services: vec!["api.example.test/a".into()],
        }
    }

    fn build_header(signing: &SigningKey, nonce: &str, timestamp: u64, domain: &str) -> String {
        let did = "did:wba:example.com:r1";
        let payload = signing_payload(did, nonce, timestamp, domain);
        let signature = signing.sign(&payload);
        format!(
            "DIDWba did=\"{did}\", nonce=\"{nonce}\", timestamp=\"{timestamp}\", \
             verification_method=\"key-1\", signature=\"{}\"",
            hex::encode(signature.to_bytes())
        )
    }

    fn verifier(signing: &SigningKey, window_secs: u64) -> DidWbaVerifier {
        let resolver = StaticResolver::from_entries(&[receiver_entry(signing)]).unwrap();
        DidWbaVerifier::new(
            Arc::new(resolver),
            Arc::new(NonceCache::new(Duration::from_secs(window_secs), 1000)),
            Duration::from_secs(window_secs),
        )
    }

    #[tokio::test]
    async fn valid_header_verifies() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let v = verifier(&signing, 300);
        let header = build_header(&signing, "nonce-1", unix_now(), "gw.example.test");
        let did = v.verify(&header, "gw.example.test").await.unwrap();
        assert_eq!(did, "did:wba:example.com:r1");
    }

    #[tokio::test]
    async fn nonce_replay_rejected() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let v = verifier(&signing, 300);
        let header = build_header(&signing, "nonce-1", unix_now(), "gw.example.test");
        v.verify(&header, "gw.example.test").await.unwrap();
        let err = v.verify(&header, "gw.example.test").await;
        assert!(matches!(err, Err(GatewayError::TunnelAuth(_))));
    }

    #[tokio::test]
    async fn stale_timestamp_rejected() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let v = verifier(&signing, 300);
        let header = build_header(&signing, "nonce-1", unix_now() - 3600, "gw.example.test");
        let err = v.verify(&header, "gw.example.test").await;
        assert!(matches!(err, Err(GatewayError::TunnelAuth(_))));
    }

    #[tokio::test]
    async fn wrong_domain_rejected() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let v = verifier(&signing, 300);
        let header = build_header(&signing, "nonce-1", unix_now(), "gw.example.test");
        let err = v.verify(&header, "evil.example.test").await;
        assert!(matches!(err, Err(GatewayError::TunnelAuth(_))));
    }

    #[tokio::test]
    async fn tampered_signature_rejected() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let v = verifier(&signing, 300);

        // Signed with a key the DID document does not publish.
        let did = "did:wba:example.com:r1";
        let ts = unix_now();
        let payload = signing_payload(did, "nonce-1", ts, "gw.example.test");
        let signature = other.sign(&payload);
        let header = format!(
            "DIDWba did=\"{did}\", nonce=\"nonce-1\", timestamp=\"{ts}\", \
             verification_method=\"key-1\", signature=\"{}\"",
            hex::encode(signature.to_bytes())
        );
        let err = v.verify(&header, "gw.example.test").await;
        assert!(matches!(err, Err(GatewayError::TunnelAuth(_))));
    }

    #[tokio::test]
    async fn unknown_did_rejected() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let v = verifier(&signing, 300);
        let header = build_header(&signing, "nonce-1", unix_now(), "gw.example.test")
            .replace("did:wba:example.com:r1", "did:wba:example.com:ghost");
        let err = v.verify(&header, "gw.example.test").await;
        assert!(matches!(err, Err(GatewayError::TunnelAuth(_))));
    }

    #[test]
    fn parse_rejects_foreign_scheme() {
        assert!(parse_header("Bearer abc").is_err());
        assert!(parse_header("DIDWba did=\"x\"").is_err()); // missing fields
    }
}
