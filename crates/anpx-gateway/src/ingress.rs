//! Public HTTP ingress.
//!
//! A single catch-all handler: any method, any path. The request becomes
//! one or more ANPX frames on a selected tunnel; the handler then waits on
//! its correlator slot until the response, an error, or the deadline.

use crate::error::GatewayError;
use crate::server::GatewayState;
use anpx_core::{strip_hop_by_hop, HttpMeta, RespMeta};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.diagnostic(),
        )
            .into_response()
    }
}

/// The catch-all axum handler.
pub async fn handle(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let host = host_of(&parts.headers, &parts.uri);
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query());
    let headers = flatten_headers(&parts.headers);

    let body = match axum::body::to_bytes(body, state.config.body_max_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "request body rejected");
            return GatewayError::PayloadTooLarge.into_response();
        }
    };

    match forward_request(
        &state,
        parts.method.as_str(),
        &host,
        &path,
        query,
        headers,
        &body,
    )
    .await
    {
        Ok((meta, body)) => build_response(meta, body),
        Err(error) => error.into_response(),
    }
}

/// Effective host: the `Host` header, falling back to the URI authority.
fn host_of(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

/// Flatten inbound headers to a lowercase map; repeated headers join with
/// `", "` in arrival order.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        let key = name.as_str().to_ascii_lowercase();
        map.entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// Split a raw query string into pairs. Values stay percent-encoded; the
/// receiver hands them to the local application untouched.
fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let Some(query) = query else { return map };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

/// Drive one request through tunnel selection, framing, and correlation.
pub async fn forward_request(
    state: &Arc<GatewayState>,
    method: &str,
    host: &str,
    path: &str,
    query: BTreeMap<String, String>,
    mut headers: BTreeMap<String, String>,
    body: &[u8],
) -> Result<(RespMeta, Vec<u8>), GatewayError> {
    if host.is_empty() {
        return Err(GatewayError::NoRoute("(no host)".into()));
    }

    strip_hop_by_hop(&mut headers);

    // Selection reserves the pending slot; every exit path below must
    // either hand the slot to the correlator or release it.
    let handle = state.router.select(host, path).await?;

    let request_id = Uuid::new_v4().to_string();
    let meta = HttpMeta {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        query,
    };

    // Track before anything can fail so release_slot pairs with the
    // reservation on every exit path.
    handle.track_request(&request_id);

    let mut rx = match state.correlator.register(&request_id, handle.id) {
        Ok(rx) => rx,
        Err(e) => {
            handle.release_slot(&request_id);
            return Err(e);
        }
    };

    let frames = match state.encoder.encode_request(&request_id, &meta, body) {
        Ok(frames) => frames,
        Err(e) => {
            state.correlator.fail(&request_id, GatewayError::Internal(e.to_string()));
            handle.release_slot(&request_id);
            return Err(GatewayError::Internal(format!("encode failed: {e}")));
        }
    };

    debug!(
        %request_id,
        conn_id = handle.id,
        frames = frames.len(),
        body = body.len(),
        "forwarding request"
    );

    for frame in &frames {
        if let Err(e) = handle.enqueue(crate::registry::Outbound::Frame(frame.encode())) {
            warn!(%request_id, conn_id = handle.id, error = %e, "tunnel enqueue failed");
            state.correlator.fail(&request_id, e.clone());
            handle.release_slot(&request_id);
            return Err(e);
        }
    }

    // Wait for completion under the request deadline. If the deadline and
    // the response race, whichever removes the slot first wins and the
    // loser is a no-op.
    let sleep = tokio::time::sleep(state.config.request_timeout);
    tokio::pin!(sleep);

    tokio::select! {
        result = &mut rx => match result {
            Ok(outcome) => outcome.map(|r| (r.meta, r.body)),
            Err(_) => Err(GatewayError::Internal("pending slot dropped".into())),
        },
        _ = &mut sleep => {
            if state.correlator.fail(&request_id, GatewayError::RequestTimeout).is_some() {
                handle.release_slot(&request_id);
                Err(GatewayError::RequestTimeout)
            } else {
                // A completion got there first; its result is already in
                // the channel.
                match rx.await {
                    Ok(outcome) => outcome.map(|r| (r.meta, r.body)),
                    Err(_) => Err(GatewayError::Internal("pending slot dropped".into())),
                }
            }
        }
    }
}

/// Rebuild the HTTP response from the tunnel's response metadata and body.
fn build_response(meta: RespMeta, body: Vec<u8>) -> Response {
    let status =
        StatusCode::from_u16(meta.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = meta.headers;
    strip_hop_by_hop(&mut headers);

    let mut response = Response::builder().status(status);
    for (name, value) in &headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::try_from(value.as_str()) else {
            continue;
        };
        response = response.header(name, value);
    }

    response
        .body(Body::from(body))
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}
