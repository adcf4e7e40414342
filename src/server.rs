//! The relay HTTP service: health endpoint, the proxied messages route, and
//! the serve loop.
//!
//! Every inbound request runs independently on the runtime; the only shared
//! mutable state is the credential cache inside [`CredentialProvider`].

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::credentials::CredentialProvider;
use crate::error::{RelayError, Result};
use crate::forward::{self, UpstreamReply};
use crate::transform;

/// Shared per-instance state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Normalized gateway base URL this instance is bound to.
    pub workspace: String,
    pub provider: Arc<CredentialProvider>,
    pub upstream: reqwest::Client,
}

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route(transform::MESSAGES_PATH, post(proxy_messages))
        .with_state(state)
}

/// Readiness plus the bound workspace identity, so instance discovery can
/// tell a compatible relay from a stranger on the same port.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "workspace": state.workspace,
    }))
}

async fn proxy_messages(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let streaming = transform::wants_stream(&body);
    match relay_request(&state, uri.path(), &headers, body, streaming).await {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(err),
    }
}

async fn relay_request(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
    streaming: bool,
) -> Result<UpstreamReply> {
    let suffix = transform::upstream_path(path)
        .ok_or_else(|| RelayError::Internal(format!("no upstream route for {path}")))?;
    let credential = state.provider.fetch().await.map_err(|err| {
        tracing::error!(error = %err, "credential resolution failed");
        err
    })?;
    let outbound =
        transform::build_outbound(&state.workspace, suffix, headers, &credential.token, body)?;
    forward::forward(&state.upstream, outbound, streaming).await
}

fn reply_response(reply: UpstreamReply) -> Response {
    match reply {
        UpstreamReply::Buffered {
            status,
            content_type,
            body,
        } => passthrough_response(status, content_type, Body::from(body)),
        UpstreamReply::Stream(upstream) => {
            // Relay chunks as they arrive; the caller-facing content type is
            // fixed because the gateway emits event-stream framing for
            // streaming requests. Dropping the body (caller disconnect)
            // closes the upstream connection.
            let status = upstream.status().as_u16();
            passthrough_response(
                status,
                Some("text/event-stream".to_string()),
                Body::from_stream(upstream.bytes_stream()),
            )
        }
    }
}

fn error_response(err: RelayError) -> Response {
    match err {
        RelayError::Gateway {
            status,
            content_type,
            body,
        } => passthrough_response(status, content_type, Body::from(body)),
        other => {
            tracing::error!(error = %other, kind = other.error_type(), "relay request failed");
            (other.http_status(), Json(other.envelope())).into_response()
        }
    }
}

fn passthrough_response(status: u16, content_type: Option<String>, body: Body) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Bind the relay listener. Localhost only.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| RelayError::Internal(format!("failed to bind 127.0.0.1:{port}: {e}")))
}

/// Run the relay until shutdown, finishing in-flight streams on ctrl-c.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, workspace = %state.workspace, "relay listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RelayError::Internal(format!("relay server failed: {e}")))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
