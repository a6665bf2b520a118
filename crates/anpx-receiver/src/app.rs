//! The local-application seam.
//!
//! The dispatcher never sees a concrete framework: a local application is
//! anything that accepts a buffered HTTP request and returns a buffered
//! response.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Boxed future so the trait stays object-safe.
pub type AppFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A fully buffered request handed to the local application.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// The local application's answer.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl LocalResponse {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .insert("content-type".to_string(), content_type.to_string());
        self.body = body;
        self
    }
}

/// The capability the receiver needs from a local application. A failed
/// invocation is reported as an error string and becomes a 500 upstream.
pub trait LocalApp: Send + Sync {
    fn accept(&self, request: LocalRequest) -> AppFuture<'_, Result<LocalResponse, String>>;
}

/// Built-in application used when no real one is wired.
///
/// Answers `GET /status` with `{"ok":true}` and echoes the SHA-256 hex
/// digest of bodies POSTed to `/upload`.
#[derive(Debug, Default)]
pub struct DemoApp;

impl LocalApp for DemoApp {
    fn accept(&self, request: LocalRequest) -> AppFuture<'_, Result<LocalResponse, String>> {
        Box::pin(async move {
            let response = match (request.method.as_str(), request.path.as_str()) {
                ("GET", "/status") => LocalResponse::new(200, "OK")
                    .with_body("application/json", br#"{"ok":true}"#.to_vec()),
                ("POST", "/upload") => {
                    let digest = hex::encode(Sha256::digest(&request.body));
                    LocalResponse::new(200, "OK").with_body("text/plain", digest.into_bytes())
                }
                _ => LocalResponse::new(404, "Not Found")
                    .with_body("text/plain", b"not found".to_vec()),
            };
            Ok(response)
        })
    }
}
