//! Gateway error taxonomy.
//!
//! Every client-visible kind maps to a fixed HTTP status; tunnel-visible
//! kinds map to a fixed WebSocket close code.

use axum::http::StatusCode;
use thiserror::Error;

/// WebSocket close code: DID authentication failed.
pub const CLOSE_AUTH_FAILED: u16 = 4003;
/// WebSocket close code: keep-alive timeout.
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 4008;
/// WebSocket close code: gateway shutting down.
pub const CLOSE_SHUTTING_DOWN: u16 = 4011;

/// Errors produced by the gateway's request path and tunnel machinery.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("tunnel protocol error: {0}")]
    TunnelProtocol(String),

    #[error("tunnel authentication failed: {0}")]
    TunnelAuth(String),

    #[error("tunnel lost")]
    TunnelLost,

    #[error("no receiver for {0}")]
    NoRoute(String),

    #[error("no capacity")]
    NoCapacity,

    #[error("request timed out")]
    RequestTimeout,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status for client-visible failures.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute(_) | GatewayError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TunnelLost | GatewayError::TunnelProtocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::TunnelAuth(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) | GatewayError::Bind(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short diagnostic sent as the response body. No internal detail.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            GatewayError::NoRoute(_) => "No receiver",
            GatewayError::NoCapacity => "No capacity",
            GatewayError::RequestTimeout => "Gateway Timeout",
            GatewayError::TunnelLost => "Bad Gateway: tunnel lost",
            GatewayError::TunnelProtocol(_) => "Bad Gateway: tunnel protocol error",
            GatewayError::PayloadTooLarge => "Payload Too Large",
            GatewayError::TunnelAuth(_) => "Bad Gateway",
            GatewayError::Config(_) | GatewayError::Bind(_) | GatewayError::Internal(_) => {
                "Internal Server Error"
            }
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_fixed() {
        assert_eq!(
            GatewayError::NoRoute("h/p".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::RequestTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::TunnelLost.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
