//! Host/path routing onto tunnels.
//!
//! Route keys are canonical service URLs: `lower(host) + normalized_path`,
//! leading slash preserved, trailing slash trimmed except at the root.
//! Resolution tries an exact match, then the longest registered prefix,
//! then a host-level entry. Selection among matching healthy tunnels is
//! least-pending-first with ties going to the oldest connection, fused
//! with the pending-counter reservation so the cap holds under bursts.

use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ConnectionId, TunnelHandle, TunnelRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Canonicalize a host + path pair into a directory key.
///
/// The host is lowercased and stripped of any port suffix; the path keeps
/// its leading slash and loses any trailing slash except for the root.
pub fn canonical_service_url(host: &str, path: &str) -> String {
    let host = host
        .split_once(':')
        .map(|(h, _)| h)
        .unwrap_or(host)
        .to_ascii_lowercase();

    let mut path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    format!("{host}{path}")
}

/// Canonicalize a service URL as advertised by the directory
/// (`host`, `host/`, or `host/path` forms all accepted).
pub fn canonical_advertised_url(service_url: &str) -> String {
    match service_url.split_once('/') {
        Some((host, path)) => canonical_service_url(host, &format!("/{path}")),
        None => canonical_service_url(service_url, "/"),
    }
}

/// Live routing table from canonical service URLs to tunnel connections.
pub struct ServiceRouter {
    registry: Arc<TunnelRegistry>,
    routes: RwLock<HashMap<String, HashSet<ConnectionId>>>,
}

impl ServiceRouter {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self {
            registry,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a tunnel's service URLs (called on admission; URLs are
    /// expected canonical).
    pub async fn publish(&self, conn_id: ConnectionId, services: &[String]) {
        let mut routes = self.routes.write().await;
        for url in services {
            routes.entry(url.clone()).or_default().insert(conn_id);
        }
        debug!(conn_id, count = services.len(), "routes published");
    }

    /// Withdraw every route pointing at a tunnel (eviction/close).
    pub async fn withdraw(&self, conn_id: ConnectionId) {
        let mut routes = self.routes.write().await;
        routes.retain(|_, conns| {
            conns.remove(&conn_id);
            !conns.is_empty()
        });
    }

    /// Resolve candidate connections for a request, in resolution order.
    async fn resolve(&self, host: &str, path: &str) -> Vec<ConnectionId> {
        let full = canonical_service_url(host, path);
        let host_key = canonical_service_url(host, "/");
        let routes = self.routes.read().await;

        // 1. Exact match.
        if let Some(conns) = routes.get(&full) {
            return conns.iter().copied().collect();
        }

        // 2. Longest prefix at a path-segment boundary (host-level entries
        //    are step 3, not prefixes).
        let mut best: Option<(&String, &HashSet<ConnectionId>)> = None;
        for (key, conns) in routes.iter() {
            if *key == host_key || !key.starts_with(&host_key) {
                continue;
            }
            let matches = full.starts_with(key.as_str())
                && (full.len() == key.len() || full.as_bytes()[key.len()] == b'/');
            if matches && best.map(|(b, _)| key.len() > b.len()).unwrap_or(true) {
                best = Some((key, conns));
            }
        }
        if let Some((_, conns)) = best {
            return conns.iter().copied().collect();
        }

        // 3. Host-only match.
        routes
            .get(&host_key)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Choose a tunnel for the request and reserve a pending slot on it in
    /// the same step.
    ///
    /// The returned handle already counts this request against its cap; the
    /// caller must pair it with `release_slot`.
    pub async fn select(&self, host: &str, path: &str) -> GatewayResult<Arc<TunnelHandle>> {
        let candidates = self.resolve(host, path).await;
        if candidates.is_empty() {
            return Err(GatewayError::NoRoute(canonical_service_url(host, path)));
        }

        let mut handles = Vec::with_capacity(candidates.len());
        for conn_id in candidates {
            if let Some(handle) = self.registry.get(conn_id).await {
                if handle.is_healthy() {
                    handles.push(handle);
                }
            }
        }
        if handles.is_empty() {
            return Err(GatewayError::NoRoute(canonical_service_url(host, path)));
        }

        handles.sort_by_key(|h| (h.pending_len(), h.created_at));
        for handle in handles {
            if handle.try_acquire_slot() {
                return Ok(handle);
            }
        }
        Err(GatewayError::NoCapacity)
    }
}
