//! Outbound request construction.
//!
//! Pure functions mapping an inbound proxied request onto the gateway call:
//! the upstream URL, the rewritten header set, and the untouched body. The
//! payload itself stays opaque except for the top-level `stream` flag that
//! selects the transport mode.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::error::{RelayError, Result};

/// The one inbound API path this relay understands.
pub const MESSAGES_PATH: &str = "/v1/messages";

const ANTHROPIC_MESSAGES_SUFFIX: &str = "/serving-endpoints/anthropic/v1/messages";

/// Header carrying the caller's own vendor key, relocated out of
/// `Authorization` so the gateway can see both credentials.
pub const API_KEY_HEADER: &str = "x-anthropic-api-key";

/// Optional beta-feature header forwarded verbatim when the caller sends it.
pub const BETA_HEADER: &str = "anthropic-beta";

/// Static traffic tag identifying this relay to the gateway.
pub const TRAFFIC_ID_HEADER: &str = "x-databricks-traffic-id";
const TRAFFIC_ID: &str = "gateway-relay/claude_max";

/// Map an inbound API path to its upstream path suffix.
///
/// A single-entry table today, but keyed by path so additional routes slot in
/// without touching the callers.
pub fn upstream_path(inbound: &str) -> Option<&'static str> {
    match inbound {
        MESSAGES_PATH => Some(ANTHROPIC_MESSAGES_SUFFIX),
        _ => None,
    }
}

/// A fully constructed gateway request, ready for the forwarding engine.
#[derive(Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Build the outbound request for one inbound call.
///
/// Header rewrites:
/// - `Authorization` becomes `Bearer <upstream_token>`
/// - the inbound `Authorization` bearer value moves to `x-anthropic-api-key`
/// - `anthropic-beta` is copied only when present
/// - content type is forced to JSON and the traffic tag is attached
pub fn build_outbound(
    workspace: &str,
    upstream_suffix: &str,
    inbound: &HeaderMap,
    upstream_token: &str,
    body: Bytes,
) -> Result<OutboundRequest> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        header_value(&format!("Bearer {upstream_token}"))?,
    );
    headers.insert(API_KEY_HEADER, header_value(inbound_bearer(inbound))?);
    if let Some(beta) = inbound.get(BETA_HEADER) {
        headers.insert(BETA_HEADER, beta.clone());
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(TRAFFIC_ID_HEADER, HeaderValue::from_static(TRAFFIC_ID));

    Ok(OutboundRequest {
        url: format!("{workspace}{upstream_suffix}"),
        headers,
        body,
    })
}

/// The caller's bearer value, empty when no `Authorization` header was sent.
fn inbound_bearer(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
        .unwrap_or("")
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|_| RelayError::Internal("credential is not a valid header value".to_string()))
}

#[derive(Debug, Deserialize)]
struct StreamProbe {
    #[serde(default)]
    stream: bool,
}

/// Read the top-level `stream` flag from an opaque JSON body.
///
/// Malformed or non-JSON bodies count as non-streaming; the gateway will
/// reject them on its own terms.
pub fn wants_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<StreamProbe>(body)
        .map(|probe| probe.stream)
        .unwrap_or(false)
}
