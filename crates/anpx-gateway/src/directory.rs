//! Service directory: which service URLs a DID is authorized to serve.
//!
//! The gateway only ever queries the abstract trait; the static
//! implementation here is backed by the `[[receivers]]` config table. A
//! database-backed implementation plugs in behind the same seam.

use crate::config::ReceiverEntry;
use crate::error::GatewayResult;
use crate::router::canonical_advertised_url;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Boxed future so the trait stays object-safe.
pub type DirFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

/// Lookup of authorized service URLs per DID. An empty result denies
/// admission.
pub trait ServiceDirectory: Send + Sync {
    fn services_for_did<'a>(&'a self, did: &'a str) -> DirFuture<'a, Vec<String>>;
}

/// In-memory directory built from configuration.
pub struct StaticDirectory {
    services: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn from_entries(entries: &[ReceiverEntry]) -> Self {
        let mut services: HashMap<String, Vec<String>> = HashMap::new();
        for entry in entries {
            let urls = services.entry(entry.did.clone()).or_default();
            for url in &entry.services {
                let canonical = canonical_advertised_url(url);
                if !urls.contains(&canonical) {
                    urls.push(canonical);
                }
            }
        }
        Self { services }
    }
}

impl ServiceDirectory for StaticDirectory {
    fn services_for_did<'a>(&'a self, did: &'a str) -> DirFuture<'a, Vec<String>> {
        Box::pin(async move { Ok(self.services.get(did).cloned().unwrap_or_default()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(did: &str, services: &[&str]) -> ReceiverEntry {
        ReceiverEntry {
            did: did.into(),
            verification_method: "key-1".into(),
            public_key: "00".repeat(32),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn known_did_gets_canonical_urls() {
        let dir = StaticDirectory::from_entries(&[entry(
            "did:wba:example.com:r1",
            &["API.Example.Test/a/", "api.example.test"],
        )]);
        let urls = dir.services_for_did("did:wba:example.com:r1").await.unwrap();
        assert_eq!(urls, vec!["api.example.test/a", "api.example.test/"]);
    }

    #[tokio::test]
    async fn unknown_did_is_empty() {
        let dir = StaticDirectory::from_entries(&[]);
        assert!(dir.services_for_did("did:wba:nope").await.unwrap().is_empty());
    }
}
