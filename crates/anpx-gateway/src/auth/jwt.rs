//! RS256 bearer tokens issued after DID-WBA admission.
//!
//! The token is an optimization credential for follow-up HTTP-side calls
//! on the same identity; it is never accepted in place of the DID-WBA
//! handshake for tunnel admission.

use crate::config::JwtSection;
use crate::error::{GatewayError, GatewayResult};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const ISSUER: &str = "anpx-gateway";

/// Claims carried by an admission token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated DID.
    pub sub: String,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

/// RS256 issuer/verifier over a configured keypair.
pub struct JwtIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl JwtIssuer {
    /// Load the keypair from the `[jwt]` config section.
    pub fn from_config(section: &JwtSection) -> GatewayResult<Self> {
        let private_pem = std::fs::read(&section.private_key_file).map_err(|e| {
            GatewayError::Config(format!(
                "cannot read {}: {e}",
                section.private_key_file.display()
            ))
        })?;
        let public_pem = std::fs::read(&section.public_key_file).map_err(|e| {
            GatewayError::Config(format!(
                "cannot read {}: {e}",
                section.public_key_file.display()
            ))
        })?;

        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(&private_pem)
                .map_err(|e| GatewayError::Config(format!("bad JWT private key: {e}")))?,
            decoding: DecodingKey::from_rsa_pem(&public_pem)
                .map_err(|e| GatewayError::Config(format!("bad JWT public key: {e}")))?,
            ttl_secs: section.ttl_secs,
        })
    }

    /// Issue a short-lived token for an admitted DID.
    pub fn issue(&self, did: &str) -> GatewayResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let claims = Claims {
            sub: did.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("JWT encode: {e}")))
    }

    /// Verify a presented token, returning its claims.
    pub fn verify(&self, token: &str) -> GatewayResult<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::TunnelAuth(format!("invalid token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("anpx-jwt-test-{}-{name}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn garbage_keys_are_config_errors() {
        let section = JwtSection {
            private_key_file: temp_file("priv.pem", b"not a pem"),
            public_key_file: temp_file("pub.pem", b"also not a pem"),
            ttl_secs: 3600,
        };
        assert!(matches!(
            JwtIssuer::from_config(&section),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn missing_key_file_is_config_error() {
        let section = JwtSection {
            private_key_file: "/nonexistent/jwt.key".into(),
            public_key_file: "/nonexistent/jwt.pub".into(),
            ttl_secs: 3600,
        };
        assert!(matches!(
            JwtIssuer::from_config(&section),
            Err(GatewayError::Config(_))
        ));
    }
}
