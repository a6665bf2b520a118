//! Request dispatch into the local application.
//!
//! Decoded requests are fully buffered, queued up to a small bound, and
//! run on at most `max_pending` concurrent workers. Requests that do not
//! fit the queue are answered immediately with an error frame carrying
//! their request id, so the gateway fails the paired HTTP request fast
//! instead of letting it time out.

use crate::app::{LocalApp, LocalRequest};
use crate::client::OutMsg;
use anpx_core::{
    salvage_request_id, Decoder, Encoder, HttpMeta, MessageType, ProtocolResult, RespMeta,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

struct Job {
    request_id: String,
    meta: HttpMeta,
    body: Vec<u8>,
}

/// Per-connection dispatcher. Owns the decode/reassembly state for its
/// tunnel and the worker pool feeding the local application.
pub struct Dispatcher {
    encoder: Encoder,
    decoder: Decoder,
    jobs_tx: mpsc::Sender<Job>,
    out_tx: mpsc::Sender<OutMsg>,
}

impl Dispatcher {
    pub fn new(
        app: Arc<dyn LocalApp>,
        chunk_size: usize,
        max_pending: usize,
        queue_depth: usize,
        out_tx: mpsc::Sender<OutMsg>,
    ) -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let encoder = Encoder::new(chunk_size);

        // Pump: pull queued jobs, gate on the worker budget, run each on
        // its own task. The permit guard keeps the budget honest for the
        // whole invocation.
        let pump_encoder = encoder.clone();
        let pump_out = out_tx.clone();
        tokio::spawn(async move {
            let budget = Arc::new(Semaphore::new(max_pending.max(1)));
            while let Some(job) = jobs_rx.recv().await {
                let Ok(permit) = budget.clone().acquire_owned().await else {
                    break;
                };
                let app = app.clone();
                let encoder = pump_encoder.clone();
                let out_tx = pump_out.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job(job, app, encoder, out_tx).await;
                });
            }
            debug!("dispatch pump stopped");
        });

        Self {
            encoder,
            decoder: Decoder::new(),
            jobs_tx,
            out_tx,
        }
    }

    /// Handle one binary tunnel message.
    ///
    /// Fatal protocol errors propagate so the caller can drop the
    /// connection; anything request-scoped is answered inline.
    pub async fn handle_message(&mut self, data: &[u8]) -> ProtocolResult<()> {
        let frame = match self.decoder.decode(data) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                if let Some(request_id) = salvage_request_id(data) {
                    self.send_error(&request_id, &format!("bad frame: {e}")).await;
                }
                return Ok(());
            }
        };

        if frame.message_type() != MessageType::Request {
            warn!(kind = ?frame.message_type(), "unexpected frame type from gateway");
            return Ok(());
        }

        let Ok(Some(request_id)) = frame.request_id() else {
            warn!("request frame without request_id");
            return Ok(());
        };
        let request_id = request_id.to_string();

        let meta = match frame.http_meta() {
            Ok(Some(meta)) => meta,
            _ => {
                warn!(%request_id, "request frame without http_meta");
                self.send_error(&request_id, "request missing metadata").await;
                return Ok(());
            }
        };
        let body = frame.http_body().unwrap_or_default().to_vec();

        let job = Job {
            request_id: request_id.clone(),
            meta,
            body,
        };
        if let Err(mpsc::error::TrySendError::Full(job)) = self.jobs_tx.try_send(job) {
            warn!(request_id = %job.request_id, "dispatch queue full, rejecting request");
            self.send_error(&job.request_id, "receiver overloaded").await;
        }
        Ok(())
    }

    /// Drop reassembly buffers idle past `ttl`. The gateway times the
    /// paired requests out on its side.
    pub fn sweep(&mut self, ttl: Duration) {
        for request_id in self.decoder.sweep(ttl) {
            warn!(%request_id, "discarded stale chunk reassembly");
        }
    }

    async fn send_error(&self, request_id: &str, message: &str) {
        let frame = self.encoder.encode_error(Some(request_id), message);
        if self.out_tx.send(OutMsg::Frame(frame.encode())).await.is_err() {
            debug!(request_id, "connection gone, error frame dropped");
        }
    }
}

/// Invoke the local application and frame its answer.
async fn run_job(job: Job, app: Arc<dyn LocalApp>, encoder: Encoder, out_tx: mpsc::Sender<OutMsg>) {
    let request = LocalRequest {
        method: job.meta.method,
        path: job.meta.path,
        headers: job.meta.headers,
        query: job.meta.query,
        body: job.body,
    };
    debug!(
        request_id = %job.request_id,
        method = %request.method,
        path = %request.path,
        "dispatching to local app"
    );

    let response = match app.accept(request).await {
        Ok(response) => response,
        Err(message) => {
            warn!(request_id = %job.request_id, error = %message, "local app failed");
            crate::app::LocalResponse::new(500, "Internal Server Error")
                .with_body("text/plain", message.into_bytes())
        }
    };

    let meta = RespMeta {
        status: response.status,
        reason: response.reason,
        headers: response.headers,
    };
    let frames = match encoder.encode_response(&job.request_id, &meta, &response.body) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(request_id = %job.request_id, error = %e, "response encode failed");
            vec![encoder.encode_error(Some(&job.request_id), "response encode failed")]
        }
    };

    for frame in frames {
        if out_tx.send(OutMsg::Frame(frame.encode())).await.is_err() {
            // Tunnel lost mid-response. The gateway has already failed or
            // will time out the paired request; nothing to resend.
            debug!(request_id = %job.request_id, "tunnel gone, response dropped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppFuture, DemoApp, LocalResponse};
    use anpx_core::Frame;
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;

    fn request_frames(request_id: &str, method: &str, path: &str, body: &[u8]) -> Vec<Frame> {
        let meta = HttpMeta {
            method: method.into(),
            path: path.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
        };
        Encoder::new(64 * 1024)
            .encode_request(request_id, &meta, body)
            .unwrap()
    }

    async fn next_logical(
        out_rx: &mut mpsc::Receiver<OutMsg>,
        decoder: &mut Decoder,
    ) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
                .await
                .expect("response in time")
                .expect("channel open");
            let OutMsg::Frame(bytes) = msg else { continue };
            if let Some(frame) = decoder.decode(&bytes).unwrap() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn request_reaches_app_and_response_comes_back() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut dispatcher = Dispatcher::new(Arc::new(DemoApp), 64 * 1024, 4, 4, out_tx);

        for frame in request_frames("r1", "GET", "/status", b"") {
            dispatcher.handle_message(&frame.encode()).await.unwrap();
        }

        let mut decoder = Decoder::new();
        let response = next_logical(&mut out_rx, &mut decoder).await;
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.request_id().unwrap(), Some("r1"));
        assert_eq!(response.resp_meta().unwrap().unwrap().status, 200);
        assert_eq!(response.http_body().unwrap(), br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn chunked_request_is_reassembled_before_invocation() {
        let body: Vec<u8> = (0..200_000).map(|i| (i % 97) as u8).collect();
        let expected = hex::encode(Sha256::digest(&body));

        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut dispatcher = Dispatcher::new(Arc::new(DemoApp), 64 * 1024, 4, 4, out_tx);

        let frames = request_frames("r2", "POST", "/upload", &body);
        assert!(frames.len() > 1);
        for frame in frames {
            dispatcher.handle_message(&frame.encode()).await.unwrap();
        }

        let mut decoder = Decoder::new();
        let response = next_logical(&mut out_rx, &mut decoder).await;
        assert_eq!(response.resp_meta().unwrap().unwrap().status, 200);
        assert_eq!(
            String::from_utf8(response.http_body().unwrap().to_vec()).unwrap(),
            expected
        );
    }

    /// App that blocks until released, for saturating the worker pool.
    struct StuckApp(Arc<tokio::sync::Notify>);

    impl LocalApp for StuckApp {
        fn accept(&self, _request: LocalRequest) -> AppFuture<'_, Result<LocalResponse, String>> {
            let release = self.0.clone();
            Box::pin(async move {
                release.notified().await;
                Ok(LocalResponse::new(204, "No Content"))
            })
        }
    }

    #[tokio::test]
    async fn overload_is_answered_with_error_frames() {
        let release = Arc::new(tokio::sync::Notify::new());
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut dispatcher =
            Dispatcher::new(Arc::new(StuckApp(release.clone())), 64 * 1024, 1, 1, out_tx);

        // One runs, one queues; give the pump a moment to drain the queue
        // slot into the worker, then fill queue and overflow.
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            for frame in request_frames(id, "GET", "/status", b"") {
                dispatcher.handle_message(&frame.encode()).await.unwrap();
            }
            if i == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        // At least the last request must have overflowed into an error
        // frame naming its request id.
        let mut decoder = Decoder::new();
        let frame = next_logical(&mut out_rx, &mut decoder).await;
        assert_eq!(frame.message_type(), MessageType::Error);
        let id = frame.request_id().unwrap().unwrap().to_string();
        assert!(["c", "d"].contains(&id.as_str()), "unexpected id {id}");

        release.notify_waiters();
    }

    /// App that always fails.
    struct FailingApp;

    impl LocalApp for FailingApp {
        fn accept(&self, _request: LocalRequest) -> AppFuture<'_, Result<LocalResponse, String>> {
            Box::pin(async { Err("boom".to_string()) })
        }
    }

    #[tokio::test]
    async fn app_failure_becomes_500_response() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut dispatcher = Dispatcher::new(Arc::new(FailingApp), 64 * 1024, 2, 2, out_tx);

        for frame in request_frames("r3", "GET", "/status", b"") {
            dispatcher.handle_message(&frame.encode()).await.unwrap();
        }

        let mut decoder = Decoder::new();
        let response = next_logical(&mut out_rx, &mut decoder).await;
        assert_eq!(response.message_type(), MessageType::Response);
        let meta = response.resp_meta().unwrap().unwrap();
        assert_eq!(meta.status, 500);
        assert_eq!(response.http_body().unwrap(), b"boom");
    }

    #[tokio::test]
    async fn corrupted_frame_is_fatal() {
        let (out_tx, _out_rx) = mpsc::channel(64);
        let mut dispatcher = Dispatcher::new(Arc::new(DemoApp), 64 * 1024, 2, 2, out_tx);

        let mut bytes = request_frames("r4", "GET", "/status", b"x")[0].encode();
        bytes[8] ^= 0x40; // total_length bit: header CRC mismatch
        let err = dispatcher.handle_message(&bytes).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
