//! Error types for the gateway relay.

use axum::body::Bytes;
use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors that can occur while relaying a request to the workspace gateway.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No upstream credential could be resolved (missing override, broker
    /// failure, broker timeout). Surfaced to the caller as a config error.
    #[error("no workspace credential available: {0}")]
    Credential(String),

    /// The gateway answered with a non-2xx status. Not a transport failure:
    /// the status and body are relayed to the caller unchanged.
    #[error("gateway returned HTTP {status}")]
    Gateway {
        /// The upstream HTTP status code.
        status: u16,
        /// The upstream `Content-Type`, if one was sent.
        content_type: Option<String>,
        /// The upstream response body, verbatim.
        body: Bytes,
    },

    /// The upstream call exceeded the forwarding timeout.
    #[error("gateway request timed out")]
    Timeout,

    /// A connection-level failure reaching the gateway.
    #[error("gateway connection failed: {0}")]
    Transport(String),

    /// The relay did not become ready within its startup window.
    #[error("relay did not become ready within {0:?}")]
    Startup(std::time::Duration),

    /// Anything else that went wrong inside the relay itself.
    #[error("proxy error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Machine-readable error kind carried in the wire envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Credential(_) => "config_error",
            Self::Gateway { .. } => "gateway_error",
            Self::Timeout => "timeout_error",
            Self::Transport(_) => "connection_error",
            Self::Startup(_) => "startup_error",
            Self::Internal(_) => "proxy_error",
        }
    }

    /// HTTP status the caller should see for this failure class.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Gateway { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON error envelope for local failures:
    /// `{"error":{"message":...,"type":...}}`.
    ///
    /// Gateway errors are not wrapped — their body is passed through verbatim
    /// by the server layer instead.
    pub fn envelope(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
