//! HTTP↔ANPX response correlator.
//!
//! Pairs each in-flight HTTP request with the tunnel response that carries
//! its request id. A slot is inserted exactly once and removed exactly
//! once, by whichever of {response, error, timeout, tunnel loss} gets
//! there first; later completions are no-ops.

use crate::error::{GatewayError, GatewayResult};
use crate::registry::ConnectionId;
use anpx_core::RespMeta;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A reconstructed tunnel response, ready to become an HTTP response.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub meta: RespMeta,
    pub body: Vec<u8>,
}

/// Outcome delivered to the waiting ingress task.
pub type SlotResult = Result<TunnelResponse, GatewayError>;

struct PendingSlot {
    created: Instant,
    conn_id: ConnectionId,
    tx: oneshot::Sender<SlotResult>,
}

/// Table of pending request slots, keyed by request id.
///
/// Locking is per-operation; the mutex is never held across an await.
#[derive(Default)]
pub struct Correlator {
    table: Mutex<HashMap<String, PendingSlot>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending slot. The returned receiver resolves when the slot
    /// completes. Duplicate request ids are rejected (never expected with
    /// fresh UUIDs).
    pub fn register(
        &self,
        request_id: &str,
        conn_id: ConnectionId,
    ) -> GatewayResult<oneshot::Receiver<SlotResult>> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock().expect("correlator lock");
        if table.contains_key(request_id) {
            return Err(GatewayError::Internal(format!(
                "duplicate request id {request_id}"
            )));
        }
        table.insert(
            request_id.to_string(),
            PendingSlot {
                created: Instant::now(),
                conn_id,
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete a slot with a response. Returns the connection the slot was
    /// assigned to, or `None` if the slot was already gone (timed out or
    /// failed first).
    pub fn complete(&self, request_id: &str, response: TunnelResponse) -> Option<ConnectionId> {
        let slot = self.table.lock().expect("correlator lock").remove(request_id)?;
        debug!(
            request_id,
            elapsed_ms = slot.created.elapsed().as_millis() as u64,
            status = response.meta.status,
            "pending request completed"
        );
        let conn_id = slot.conn_id;
        let _ = slot.tx.send(Ok(response));
        Some(conn_id)
    }

    /// Fail a slot. Same no-op semantics as [`Correlator::complete`].
    pub fn fail(&self, request_id: &str, error: GatewayError) -> Option<ConnectionId> {
        let slot = self.table.lock().expect("correlator lock").remove(request_id)?;
        warn!(request_id, %error, "pending request failed");
        let conn_id = slot.conn_id;
        let _ = slot.tx.send(Err(error));
        Some(conn_id)
    }

    /// Fail every slot assigned to `conn_id` (tunnel loss). Returns the
    /// request ids that were failed.
    pub fn fail_all_for(&self, conn_id: ConnectionId, error: &GatewayError) -> Vec<String> {
        let drained: Vec<(String, PendingSlot)> = {
            let mut table = self.table.lock().expect("correlator lock");
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, slot)| slot.conn_id == conn_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let mut failed = Vec::with_capacity(drained.len());
        for (request_id, slot) in drained {
            let _ = slot.tx.send(Err(error.clone()));
            failed.push(request_id);
        }
        if !failed.is_empty() {
            warn!(conn_id, count = failed.len(), "failed pending requests for lost tunnel");
        }
        failed
    }

    /// Fail slots older than `max_age`.
    ///
    /// The normal timeout path runs inside the waiting ingress task; this
    /// sweep is the backstop that reclaims slots whose waiter was cancelled
    /// (client disconnect) before its timer fired. Returns `(request_id,
    /// conn_id)` pairs so the caller can release the tunnel-side slots.
    pub fn sweep_stale(&self, max_age: std::time::Duration) -> Vec<(String, ConnectionId)> {
        let drained: Vec<(String, PendingSlot)> = {
            let mut table = self.table.lock().expect("correlator lock");
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, slot)| slot.created.elapsed() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        drained
            .into_iter()
            .map(|(request_id, slot)| {
                let _ = slot.tx.send(Err(GatewayError::RequestTimeout));
                (request_id, slot.conn_id)
            })
            .collect()
    }

    /// Number of in-flight slots.
    pub fn len(&self) -> usize {
        self.table.lock().expect("correlator lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn response(status: u16) -> TunnelResponse {
        TunnelResponse {
            meta: RespMeta {
                status,
                reason: String::new(),
                headers: BTreeMap::new(),
            },
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn complete_resolves_waiter() {
        let correlator = Correlator::new();
        let rx = correlator.register("r1", 7).unwrap();

        assert_eq!(correlator.complete("r1", response(200)), Some(7));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.meta.status, 200);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn second_completion_is_noop() {
        let correlator = Correlator::new();
        let rx = correlator.register("r1", 1).unwrap();

        assert!(correlator.complete("r1", response(200)).is_some());
        assert!(correlator.complete("r1", response(500)).is_none());
        assert!(correlator.fail("r1", GatewayError::RequestTimeout).is_none());

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.meta.status, 200);
    }

    #[tokio::test]
    async fn fail_resolves_waiter_with_error() {
        let correlator = Correlator::new();
        let rx = correlator.register("r1", 1).unwrap();

        correlator.fail("r1", GatewayError::TunnelLost);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(GatewayError::TunnelLost)));
    }

    #[test]
    fn duplicate_request_id_rejected() {
        let correlator = Correlator::new();
        let _rx = correlator.register("r1", 1).unwrap();
        assert!(correlator.register("r1", 2).is_err());
    }

    #[tokio::test]
    async fn tunnel_loss_fails_only_its_slots() {
        let correlator = Correlator::new();
        let rx_a = correlator.register("a", 1).unwrap();
        let rx_b = correlator.register("b", 1).unwrap();
        let rx_c = correlator.register("c", 2).unwrap();

        let mut failed = correlator.fail_all_for(1, &GatewayError::TunnelLost);
        failed.sort();
        assert_eq!(failed, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(rx_a.await.unwrap(), Err(GatewayError::TunnelLost)));
        assert!(matches!(rx_b.await.unwrap(), Err(GatewayError::TunnelLost)));
        assert_eq!(correlator.len(), 1);

        correlator.complete("c", response(204));
        assert_eq!(rx_c.await.unwrap().unwrap().meta.status, 204);
    }
}
