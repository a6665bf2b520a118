//! Tunnel admission: DID-WBA verification, nonce replay protection, and
//! optional RS256 token issuance.

pub mod didwba;
pub mod jwt;
pub mod nonce;

pub use didwba::{DidDocument, DidResolver, DidWbaVerifier, StaticResolver};
pub use jwt::JwtIssuer;
pub use nonce::NonceCache;
