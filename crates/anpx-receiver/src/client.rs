//! The tunnel client.
//!
//! Opens the WebSocket to the gateway with a freshly signed DID-WBA
//! header, serves the connection until it drops, and reconnects with
//! exponential backoff. In-flight requests on a lost tunnel fail locally;
//! the gateway has already failed or will time out their HTTP pairs.

use crate::app::LocalApp;
use crate::auth::{build_authorization, load_signing_key};
use crate::config::ReceiverConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ReceiverError, ReceiverResult};
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Messages queued for the connection's writer task.
#[derive(Debug)]
pub enum OutMsg {
    /// A binary ANPX frame.
    Frame(Vec<u8>),
    /// A JSON control message (text frame).
    Control(String),
    /// A WebSocket pong echoing a received ping payload.
    Pong(Vec<u8>),
}

/// Capacity of the outbound write queue.
const WRITE_QUEUE_DEPTH: usize = 256;

/// The receiver client: connection lifecycle plus reconnect policy.
pub struct ReceiverClient {
    config: ReceiverConfig,
    app: Arc<dyn LocalApp>,
    signing_key: SigningKey,
}

impl ReceiverClient {
    pub fn new(config: ReceiverConfig, app: Arc<dyn LocalApp>) -> ReceiverResult<Self> {
        let key_file = config
            .key_file
            .clone()
            .ok_or_else(|| ReceiverError::Config("identity.key_file is required".into()))?;
        let signing_key = load_signing_key(&key_file)?;
        Ok(Self {
            config,
            app,
            signing_key,
        })
    }

    /// Run until cancelled: connect, serve, back off, reconnect.
    pub async fn run(&self) {
        let mut backoff = self.config.initial_backoff;

        loop {
            match self.connect_and_serve().await {
                Ok(()) => {
                    info!("tunnel closed by gateway");
                    backoff = self.config.initial_backoff;
                }
                Err(e) => {
                    warn!(error = %e, "tunnel connection failed");
                }
            }

            info!(delay_secs = backoff.as_secs(), "reconnecting after backoff");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * self.config.backoff_factor).min(self.config.max_backoff);
        }
    }

    async fn connect_and_serve(&self) -> ReceiverResult<()> {
        let mut request = self
            .config
            .gateway_url
            .as_str()
            .into_client_request()
            .map_err(|e| ReceiverError::Transport(format!("bad gateway URL: {e}")))?;

        let header = build_authorization(
            &self.config.did,
            &self.config.verification_method,
            &self.signing_key,
            &self.config.gateway_url,
        );
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&header)
                .map_err(|e| ReceiverError::Transport(format!("bad auth header: {e}")))?,
        );

        info!(url = %self.config.gateway_url, did = %self.config.did, "connecting to gateway");
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ReceiverError::Transport(format!("connect failed: {e}")))?;

        run_connection(ws, &self.config, self.app.clone()).await
    }
}

/// Serve one established tunnel until it ends.
///
/// Generic over the stream so tests can drive it over an in-memory pipe.
pub async fn run_connection<S>(
    ws: WebSocketStream<S>,
    config: &ReceiverConfig,
    app: Arc<dyn LocalApp>,
) -> ReceiverResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutMsg>(WRITE_QUEUE_DEPTH);

    // Writer task: the single place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let result = match out {
                OutMsg::Frame(data) => sink.send(Message::Binary(data.into())).await,
                OutMsg::Control(json) => sink.send(Message::Text(json.into())).await,
                OutMsg::Pong(payload) => sink.send(Message::Pong(payload.into())).await,
            };
            if let Err(e) = result {
                debug!(error = %e, "tunnel write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut dispatcher = Dispatcher::new(
        app,
        config.chunk_size,
        config.max_pending,
        config.queue_depth,
        out_tx.clone(),
    );

    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;

    let mut sweep_interval = tokio::time::interval(Duration::from_secs(60));
    sweep_interval.tick().await;

    let result = loop {
        tokio::select! {
            message = stream.next() => match message {
                None => break Ok(()),
                Some(Err(e)) => {
                    break Err(ReceiverError::Transport(format!("read failed: {e}")));
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = dispatcher.handle_message(&data).await {
                        warn!(error = %e, "corrupted tunnel stream");
                        break Err(ReceiverError::Protocol(e));
                    }
                }
                Some(Ok(Message::Text(text))) => handle_control(&text, &out_tx).await,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = out_tx.send(OutMsg::Pong(payload.to_vec())).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = &frame {
                        info!(code = %frame.code, reason = %frame.reason, "gateway closed tunnel");
                    }
                    break Ok(());
                }
                Some(Ok(_)) => {}
            },
            _ = ping_interval.tick() => {
                let ping = serde_json::json!({
                    "type": "ping",
                    "timestamp": unix_now(),
                });
                if out_tx.send(OutMsg::Control(ping.to_string())).await.is_err() {
                    break Err(ReceiverError::Transport("writer gone".into()));
                }
            }
            _ = sweep_interval.tick() => {
                dispatcher.sweep(Duration::from_secs(300));
            }
        }
    };

    // Dropping the dispatcher and out_tx ends the writer; in-flight app
    // invocations find the channel closed and drop their responses.
    drop(dispatcher);
    drop(out_tx);
    let _ = writer.await;
    result
}

async fn handle_control(text: &str, out_tx: &mpsc::Sender<OutMsg>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "invalid control message");
            return;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("auth_ok") => {
            let services = value
                .get("services")
                .and_then(|s| s.as_array())
                .map(|s| s.len())
                .unwrap_or(0);
            let has_jwt = value.get("jwt").map(|j| !j.is_null()).unwrap_or(false);
            info!(services, bearer_token = has_jwt, "admitted by gateway");
        }
        Some("ping") => {
            let pong = serde_json::json!({
                "type": "pong",
                "timestamp": value.get("timestamp").cloned().unwrap_or_default(),
            });
            let _ = out_tx.send(OutMsg::Control(pong.to_string())).await;
        }
        Some("pong") => debug!("pong from gateway"),
        Some(other) => debug!(kind = other, "ignored control message"),
        None => debug!("control message without type"),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::DemoApp;
    use anpx_core::{Decoder, Encoder, HttpMeta, MessageType};
    use std::collections::BTreeMap;

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            gateway_url: "ws://gw.example.test".into(),
            ping_interval: Duration::from_secs(10),
            did: "did:wba:example.com:r1".into(),
            verification_method: "key-1".into(),
            key_file: None,
            max_pending: 4,
            queue_depth: 4,
            chunk_size: 64 * 1024,
            initial_backoff: Duration::from_secs(5),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(300),
        }
    }

    /// Drive `run_connection` from a fake gateway over an in-memory pipe.
    #[tokio::test]
    async fn serves_requests_over_the_tunnel() {
        let (gateway_end, receiver_end) = tokio::io::duplex(256 * 1024);

        // Gateway side: plain WebSocket server handshake.
        let gateway = tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(gateway_end).await.unwrap();

            let meta = HttpMeta {
                method: "GET".into(),
                path: "/status".into(),
                headers: BTreeMap::new(),
                query: BTreeMap::new(),
            };
            let frames = Encoder::new(64 * 1024)
                .encode_request("req-1", &meta, b"")
                .unwrap();
            for frame in frames {
                ws.send(Message::Binary(frame.encode().into())).await.unwrap();
            }

            let mut decoder = Decoder::new();
            loop {
                let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                    .await
                    .expect("response in time")
                    .expect("stream open")
                    .expect("read ok");
                match message {
                    Message::Binary(data) => {
                        if let Some(frame) = decoder.decode(&data).unwrap() {
                            let _ = ws.close(None).await;
                            return frame;
                        }
                    }
                    _ => continue,
                }
            }
        });

        // Receiver side: the real connection loop.
        let receiver = tokio::spawn(async move {
            let (ws, _) = tokio_tungstenite::client_async(
                "ws://gw.example.test/",
                receiver_end,
            )
            .await
            .unwrap();
            run_connection(ws, &test_config(), Arc::new(DemoApp)).await
        });

        let response = gateway.await.unwrap();
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.request_id().unwrap(), Some("req-1"));
        assert_eq!(response.resp_meta().unwrap().unwrap().status, 200);
        assert_eq!(response.http_body().unwrap(), br#"{"ok":true}"#);

        let result = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("receiver ends")
            .unwrap();
        assert!(result.is_ok());
    }

    /// A corrupted frame from the gateway must end the connection with a
    /// protocol error (the reconnect loop then backs off and retries).
    #[tokio::test]
    async fn corrupted_stream_ends_connection() {
        let (gateway_end, receiver_end) = tokio::io::duplex(64 * 1024);

        let gateway = tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(gateway_end).await.unwrap();
            let meta = HttpMeta {
                method: "GET".into(),
                path: "/status".into(),
                headers: BTreeMap::new(),
                query: BTreeMap::new(),
            };
            let mut bytes = Encoder::new(64 * 1024)
                .encode_request("req-1", &meta, b"payload")
                .unwrap()[0]
                .encode();
            bytes[9] ^= 0x01; // header corruption
            ws.send(Message::Binary(bytes.into())).await.unwrap();
            // Keep the socket open; the receiver should drop it.
            let _ = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
        });

        let (ws, _) = tokio_tungstenite::client_async("ws://gw.example.test/", receiver_end)
            .await
            .unwrap();
        let result = run_connection(ws, &test_config(), Arc::new(DemoApp)).await;
        assert!(matches!(result, Err(ReceiverError::Protocol(_))));
        gateway.abort();
    }
}
