//! Tunnel-connection registry.
//!
//! Tracks every admitted WebSocket tunnel, its health state, and its
//! pending-request budget. The registry owns the table; each tunnel's
//! reader/writer tasks own their handle.

use crate::error::{GatewayError, GatewayResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Messages queued for a tunnel's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A binary ANPX frame.
    Frame(Vec<u8>),
    /// A JSON control message (text frame).
    Control(String),
    /// A WebSocket ping.
    Ping(Vec<u8>),
    /// A WebSocket pong echoing a received ping payload.
    Pong(Vec<u8>),
    /// Close the socket with the given code and reason, then stop.
    Close(u16, String),
}

/// Tunnel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Handshaking = 0,
    Authenticating = 1,
    Healthy = 2,
    Draining = 3,
    Dead = 4,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Handshaking,
            1 => TunnelState::Authenticating,
            2 => TunnelState::Healthy,
            3 => TunnelState::Draining,
            _ => TunnelState::Dead,
        }
    }
}

/// Shared handle for one admitted tunnel.
pub struct TunnelHandle {
    pub id: ConnectionId,
    pub did: String,
    /// Canonical service URLs bound at admission.
    pub services: Vec<String>,
    pub created_at: Instant,
    state: AtomicU8,
    frame_tx: mpsc::Sender<Outbound>,
    pending: StdMutex<HashSet<String>>,
    pending_count: AtomicUsize,
    max_pending: usize,
    last_pong: StdMutex<Instant>,
    requests_served: AtomicU64,
}

impl TunnelHandle {
    pub fn new(
        id: ConnectionId,
        did: String,
        services: Vec<String>,
        frame_tx: mpsc::Sender<Outbound>,
        max_pending: usize,
    ) -> Self {
        Self {
            id,
            did,
            services,
            created_at: Instant::now(),
            state: AtomicU8::new(TunnelState::Healthy as u8),
            frame_tx,
            pending: StdMutex::new(HashSet::new()),
            pending_count: AtomicUsize::new(0),
            max_pending,
            last_pong: StdMutex::new(Instant::now()),
            requests_served: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TunnelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == TunnelState::Healthy
    }

    pub fn pending_len(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Reserve a pending-request slot.
    ///
    /// The increment is a compare-and-swap loop so a tunnel observed at
    /// capacity `k` is already at `k + 1` before any other selection can
    /// run; the cap cannot be exceeded under concurrent bursts.
    pub fn try_acquire_slot(&self) -> bool {
        if !self.is_healthy() || self.frame_tx.capacity() == 0 {
            return false;
        }
        self.pending_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_pending).then_some(count + 1)
            })
            .is_ok()
    }

    /// Record the request id for a slot reserved via `try_acquire_slot`.
    pub fn track_request(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("pending lock")
            .insert(request_id.to_string());
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one slot, whether it completed, failed, or timed out.
    pub fn release_slot(&self, request_id: &str) {
        let removed = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(request_id);
        if removed {
            self.pending_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drain the pending set on tunnel loss. The counter resets to zero.
    pub fn take_pending(&self) -> Vec<String> {
        let drained: Vec<String> = self
            .pending
            .lock()
            .expect("pending lock")
            .drain()
            .collect();
        self.pending_count.store(0, Ordering::Release);
        drained
    }

    /// Queue an outbound message; a full write queue is backpressure and
    /// reads as "no capacity" to the router.
    pub fn enqueue(&self, message: Outbound) -> GatewayResult<()> {
        self.frame_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::NoCapacity,
            mpsc::error::TrySendError::Closed(_) => GatewayError::TunnelLost,
        })
    }

    pub fn touch_pong(&self) {
        *self.last_pong.lock().expect("pong lock") = Instant::now();
    }

    pub fn since_last_pong(&self) -> Duration {
        self.last_pong.lock().expect("pong lock").elapsed()
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("did", &self.did)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Registry of admitted tunnels.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<ConnectionId, Arc<TunnelHandle>>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl TunnelRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Allocate a connection id for a tunnel entering the handshake.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish an authenticated tunnel.
    pub async fn admit(&self, handle: Arc<TunnelHandle>) -> GatewayResult<()> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.len() >= self.max_connections {
            return Err(GatewayError::NoCapacity);
        }
        info!(
            conn_id = handle.id,
            did = %handle.did,
            services = handle.services.len(),
            "tunnel admitted"
        );
        tunnels.insert(handle.id, handle);
        Ok(())
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<TunnelHandle>> {
        self.tunnels.read().await.get(&id).cloned()
    }

    /// Remove a tunnel; its pending slots are the caller's to fail.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<TunnelHandle>> {
        let handle = self.tunnels.write().await.remove(&id);
        if let Some(handle) = &handle {
            handle.set_state(TunnelState::Dead);
            debug!(conn_id = id, "tunnel removed from registry");
        }
        handle
    }

    pub async fn list(&self) -> Vec<Arc<TunnelHandle>> {
        self.tunnels.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Move every tunnel to `draining`: no new requests are assigned, and
    /// writers are told to close once the shutdown deadline passes.
    pub async fn drain_all(&self) {
        for handle in self.tunnels.read().await.values() {
            if handle.is_healthy() {
                handle.set_state(TunnelState::Draining);
            }
        }
    }

    /// Evict tunnels whose keep-alive lapsed. Returns the evicted handles
    /// so the caller can fail their pending requests and close sockets.
    pub async fn sweep_dead(&self, keepalive_timeout: Duration) -> Vec<Arc<TunnelHandle>> {
        let stale: Vec<ConnectionId> = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .values()
                .filter(|h| {
                    h.state() == TunnelState::Dead || h.since_last_pong() > keepalive_timeout
                })
                .map(|h| h.id)
                .collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        if !stale.is_empty() {
            let mut tunnels = self.tunnels.write().await;
            for id in stale {
                if let Some(handle) = tunnels.remove(&id) {
                    handle.set_state(TunnelState::Dead);
                    warn!(conn_id = id, did = %handle.did, "evicted stale tunnel");
                    evicted.push(handle);
                }
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId, max_pending: usize) -> Arc<TunnelHandle> {
        let (tx, _rx) = mpsc::channel(64);
        Arc::new(TunnelHandle::new(
            id,
            format!("did:wba:example.com:r{id}"),
            vec!["api.example.test/".to_string()],
            tx,
            max_pending,
        ))
    }

    #[test]
    fn slot_cap_is_never_exceeded() {
        let h = handle(1, 3);
        assert!(h.try_acquire_slot());
        assert!(h.try_acquire_slot());
        assert!(h.try_acquire_slot());
        assert!(!h.try_acquire_slot());
        assert_eq!(h.pending_len(), 3);

        h.track_request("a");
        h.release_slot("a");
        assert_eq!(h.pending_len(), 2);
        assert!(h.try_acquire_slot());
    }

    #[test]
    fn concurrent_acquires_respect_cap() {
        let h = handle(1, 50);
        let mut threads = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            threads.push(std::thread::spawn(move || {
                let mut won = 0u32;
                for _ in 0..25 {
                    if h.try_acquire_slot() {
                        won += 1;
                    }
                }
                won
            }));
        }
        let total: u32 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(h.pending_len(), 50);
    }

    #[test]
    fn unhealthy_tunnel_refuses_slots() {
        let h = handle(1, 3);
        h.set_state(TunnelState::Draining);
        assert!(!h.try_acquire_slot());
        h.set_state(TunnelState::Dead);
        assert!(!h.try_acquire_slot());
    }

    #[test]
    fn take_pending_resets_counter() {
        let h = handle(1, 10);
        for id in ["a", "b", "c"] {
            assert!(h.try_acquire_slot());
            h.track_request(id);
        }
        let mut drained = h.take_pending();
        drained.sort();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert_eq!(h.pending_len(), 0);
    }

    #[tokio::test]
    async fn registry_enforces_max_connections() {
        let registry = TunnelRegistry::new(2);
        registry.admit(handle(registry.next_id(), 10)).await.unwrap();
        registry.admit(handle(registry.next_id(), 10)).await.unwrap();
        let err = registry.admit(handle(registry.next_id(), 10)).await;
        assert!(matches!(err, Err(GatewayError::NoCapacity)));
    }

    #[tokio::test]
    async fn removed_tunnel_is_dead() {
        let registry = TunnelRegistry::new(10);
        let h = handle(registry.next_id(), 10);
        let id = h.id;
        registry.admit(h).await.unwrap();

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.state(), TunnelState::Dead);
        assert!(!removed.try_acquire_slot());
        assert!(registry.get(id).await.is_none());
    }
}
