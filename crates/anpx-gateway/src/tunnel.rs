//! Per-tunnel connection handling.
//!
//! Each accepted WebSocket runs one reader task (this module's main loop)
//! and one writer task draining the tunnel's bounded outbound queue, so
//! all socket writes are serialized. Admission happens before the tunnel
//! is published anywhere: a failed DID-WBA handshake closes the socket
//! without registering any state.

use crate::correlator::TunnelResponse;
use crate::error::{
    GatewayError, CLOSE_AUTH_FAILED, CLOSE_KEEPALIVE_TIMEOUT, CLOSE_SHUTTING_DOWN,
};
use crate::registry::{Outbound, TunnelHandle, TunnelState};
use crate::server::GatewayState;
use anpx_core::{salvage_request_id, Decoder, Frame, MessageType};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Capacity of each tunnel's outbound write queue. A full queue reads as
/// backpressure to the router.
const WRITE_QUEUE_DEPTH: usize = 256;

/// How often draining tunnels are polled for completion.
const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Serve one inbound tunnel connection end to end.
pub async fn serve_connection<S>(stream: S, peer: std::net::SocketAddr, state: Arc<GatewayState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Capture the headers we need out of the upgrade request.
    let mut authorization: Option<String> = None;
    let mut host: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        authorization = header_string(req, "authorization");
        host = header_string(req, "host");
        Ok(resp)
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let conn_id = state.registry.next_id();
    debug!(conn_id, remote = %peer, "tunnel handshaking");

    // Admission: authenticating.
    let domain = host
        .as_deref()
        .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
        .unwrap_or_default();

    let did = match authorization {
        Some(value) => match state.verifier.verify(&value, &domain).await {
            Ok(did) => did,
            Err(e) => {
                info!(conn_id, remote = %peer, error = %e, "DID authentication failed");
                close_now(&mut ws, CLOSE_AUTH_FAILED, "authentication failed").await;
                return;
            }
        },
        None => {
            info!(conn_id, remote = %peer, "missing Authorization header");
            close_now(&mut ws, CLOSE_AUTH_FAILED, "authentication required").await;
            return;
        }
    };

    let services = match state.directory.services_for_did(&did).await {
        Ok(services) if !services.is_empty() => services,
        Ok(_) => {
            info!(conn_id, %did, "DID has no authorized services");
            close_now(&mut ws, CLOSE_AUTH_FAILED, "no authorized services").await;
            return;
        }
        Err(e) => {
            error!(conn_id, %did, error = %e, "service directory lookup failed");
            close_now(&mut ws, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let (frame_tx, frame_rx) = mpsc::channel::<Outbound>(WRITE_QUEUE_DEPTH);
    let handle = Arc::new(TunnelHandle::new(
        conn_id,
        did.clone(),
        services,
        frame_tx,
        state.config.max_pending_per_connection,
    ));

    if let Err(e) = state.registry.admit(handle.clone()).await {
        warn!(conn_id, %did, error = %e, "admission refused");
        close_now(&mut ws, 1013, "gateway at connection capacity").await;
        return;
    }
    state.router.publish(conn_id, &handle.services).await;

    // Tell the receiver it is in, optionally with a bearer token for
    // HTTP-side calls on the same identity.
    let token = state.jwt.as_ref().and_then(|issuer| issuer.issue(&did).ok());
    let auth_ok = serde_json::json!({
        "type": "auth_ok",
        "connection_id": conn_id,
        "services": handle.services,
        "jwt": token,
    });
    let _ = handle.enqueue(Outbound::Control(auth_ok.to_string()));

    let (sink, ws_stream) = ws.split();
    let writer = tokio::spawn(writer_loop(sink, frame_rx));

    reader_loop(ws_stream, handle.clone(), state.clone()).await;

    // Teardown: whatever ended the reader, the tunnel is gone.
    teardown(&state, &handle, GatewayError::TunnelLost).await;

    // Let the writer flush any queued close frame, then stop it.
    let _ = handle.enqueue(Outbound::Close(1000, "closed".into()));
    let abort = writer.abort_handle();
    if tokio::time::timeout(std::time::Duration::from_secs(2), writer)
        .await
        .is_err()
    {
        abort.abort();
    }
    info!(conn_id, %did, served = handle.requests_served(), "tunnel closed");
}

fn header_string(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn close_now<S>(ws: &mut WebSocketStream<S>, code: u16, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

/// Drain the outbound queue onto the socket. Exits on queue close, socket
/// error, or an explicit `Outbound::Close`.
async fn writer_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frame_rx: mpsc::Receiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(outbound) = frame_rx.recv().await {
        let result = match outbound {
            Outbound::Frame(data) => sink.send(Message::Binary(data.into())).await,
            Outbound::Control(json) => sink.send(Message::Text(json.into())).await,
            Outbound::Ping(payload) => sink.send(Message::Ping(payload.into())).await,
            Outbound::Pong(payload) => sink.send(Message::Pong(payload.into())).await,
            Outbound::Close(code, reason) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "tunnel write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn reader_loop<S>(
    mut ws_stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    handle: Arc<TunnelHandle>,
    state: Arc<GatewayState>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = Decoder::new();
    let keepalive = state.config.keepalive_interval;

    let mut ping_interval = tokio::time::interval(keepalive);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await; // first tick fires immediately

    let mut sweep_interval = tokio::time::interval(std::time::Duration::from_secs(60));
    sweep_interval.tick().await;

    let mut shutdown_rx = state.shutdown.subscribe();
    let mut draining = false;

    loop {
        tokio::select! {
            message = ws_stream.next() => {
                match message {
                    None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = handle.id, error = %e, "tunnel read error");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if handle_frame(&data, &mut decoder, &handle, &state).is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => handle_control(&text, &handle),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = handle.enqueue(Outbound::Pong(payload.to_vec()));
                    }
                    Some(Ok(Message::Pong(_))) => handle.touch_pong(),
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_interval.tick() => {
                if handle.since_last_pong() > keepalive * 2 {
                    warn!(conn_id = handle.id, "keep-alive timeout");
                    handle.set_state(TunnelState::Dead);
                    let _ = handle.enqueue(Outbound::Close(
                        CLOSE_KEEPALIVE_TIMEOUT,
                        "keep-alive timeout".into(),
                    ));
                    break;
                }
                let _ = handle.enqueue(Outbound::Ping(Vec::new()));
            }
            _ = sweep_interval.tick() => {
                for request_id in decoder.sweep(state.config.reassembly_idle_ttl) {
                    warn!(conn_id = handle.id, %request_id, "reassembly buffer expired");
                    if state.correlator.fail(
                        &request_id,
                        GatewayError::TunnelProtocol("reassembly timeout".into()),
                    ).is_some() {
                        handle.release_slot(&request_id);
                    }
                }
            }
            _ = shutdown_rx.recv(), if !draining => {
                draining = true;
                handle.set_state(TunnelState::Draining);
                info!(conn_id = handle.id, "tunnel draining");
                tokio::spawn(drain_then_close(
                    handle.clone(),
                    state.config.request_timeout,
                ));
            }
        }
    }
}

/// Give a draining tunnel until the shutdown deadline to finish its
/// pending requests, then close it.
async fn drain_then_close(handle: Arc<TunnelHandle>, deadline: std::time::Duration) {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        if handle.pending_len() == 0 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    let _ = handle.enqueue(Outbound::Close(CLOSE_SHUTTING_DOWN, "shutting down".into()));
}

/// Outcome of processing one binary frame.
enum FrameOutcome {
    Continue,
    CloseTunnel,
}

impl FrameOutcome {
    fn is_break(&self) -> bool {
        matches!(self, FrameOutcome::CloseTunnel)
    }
}

fn handle_frame(
    data: &[u8],
    decoder: &mut Decoder,
    handle: &Arc<TunnelHandle>,
    state: &Arc<GatewayState>,
) -> FrameOutcome {
    match decoder.decode(data) {
        Ok(Some(frame)) => deliver_frame(&frame, handle, state),
        Ok(None) => FrameOutcome::Continue,
        Err(e) if e.is_fatal() => {
            error!(conn_id = handle.id, error = %e, "corrupted tunnel stream");
            let _ = handle.enqueue(Outbound::Close(1002, format!("protocol error: {e}")));
            FrameOutcome::CloseTunnel
        }
        Err(e) => {
            // Request-scoped: fail just that request if the frame still
            // names one.
            warn!(conn_id = handle.id, error = %e, "dropping malformed frame");
            if let Some(request_id) = salvage_request_id(data) {
                if state
                    .correlator
                    .fail(&request_id, GatewayError::TunnelProtocol(e.to_string()))
                    .is_some()
                {
                    handle.release_slot(&request_id);
                }
            }
            FrameOutcome::Continue
        }
    }
}

fn deliver_frame(
    frame: &Frame,
    handle: &Arc<TunnelHandle>,
    state: &Arc<GatewayState>,
) -> FrameOutcome {
    let request_id = match frame.request_id() {
        Ok(Some(id)) => id.to_string(),
        _ => {
            warn!(conn_id = handle.id, "frame without request_id");
            return FrameOutcome::Continue;
        }
    };

    match frame.message_type() {
        MessageType::Response => {
            let meta = match frame.resp_meta() {
                Ok(Some(meta)) => meta,
                _ => {
                    warn!(conn_id = handle.id, %request_id, "response missing resp_meta");
                    if state
                        .correlator
                        .fail(
                            &request_id,
                            GatewayError::TunnelProtocol("response missing metadata".into()),
                        )
                        .is_some()
                    {
                        handle.release_slot(&request_id);
                    }
                    return FrameOutcome::Continue;
                }
            };
            let body = frame.http_body().unwrap_or_default().to_vec();
            if state
                .correlator
                .complete(&request_id, TunnelResponse { meta, body })
                .is_some()
            {
                handle.release_slot(&request_id);
            } else {
                debug!(conn_id = handle.id, %request_id, "late response discarded");
            }
        }
        MessageType::Error => {
            let message = frame
                .http_body()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_else(|| "receiver error".to_string());
            if state
                .correlator
                .fail(&request_id, GatewayError::TunnelProtocol(message))
                .is_some()
            {
                handle.release_slot(&request_id);
            }
        }
        MessageType::Request => {
            warn!(conn_id = handle.id, %request_id, "unexpected request frame from receiver");
        }
    }
    FrameOutcome::Continue
}

fn handle_control(text: &str, handle: &Arc<TunnelHandle>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(conn_id = handle.id, error = %e, "invalid control message");
            return;
        }
    };

    // Any well-formed control traffic counts as liveness.
    handle.touch_pong();

    match value.get("type").and_then(|t| t.as_str()) {
        Some("ping") => {
            let pong = serde_json::json!({
                "type": "pong",
                "timestamp": value.get("timestamp").cloned().unwrap_or_default(),
            });
            let _ = handle.enqueue(Outbound::Control(pong.to_string()));
        }
        Some("pong") => {}
        Some(other) => debug!(conn_id = handle.id, kind = other, "ignored control message"),
        None => debug!(conn_id = handle.id, "control message without type"),
    }
}

/// Remove a tunnel from every table and fail its pending requests.
pub async fn teardown(state: &Arc<GatewayState>, handle: &Arc<TunnelHandle>, error: GatewayError) {
    handle.set_state(TunnelState::Dead);
    state.registry.remove(handle.id).await;
    state.router.withdraw(handle.id).await;

    let failed = state.correlator.fail_all_for(handle.id, &error);
    let drained = handle.take_pending();
    debug!(
        conn_id = handle.id,
        failed = failed.len(),
        tracked = drained.len(),
        "tunnel state cleared"
    );
}
