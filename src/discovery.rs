//! Instance discovery: one running relay per workspace.
//!
//! Repeated CLI invocations should reuse a relay that is already listening on
//! the well-known port instead of spawning duplicates — but only when it
//! serves the same workspace. The protocol is observe-only: liveness comes
//! from the health endpoint, never from a persisted registry.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use crate::error::{RelayError, Result};

/// Port a freshly launched relay prefers to bind.
pub const WELL_KNOWN_PORT: u16 = 8000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Find a usable port for a relay serving `workspace`.
///
/// Returns `(port, already_running)`:
/// 1. a healthy relay on `preferred` reporting the same workspace → reuse it;
/// 2. `preferred` free → bind-test, release, start fresh there;
/// 3. `preferred` occupied by something incompatible → OS-assigned ephemeral
///    port, released for the caller to bind.
pub async fn acquire_port(workspace: &str, preferred: u16) -> Result<(u16, bool)> {
    if probe_health(preferred, workspace).await {
        tracing::info!(port = preferred, "reusing running relay instance");
        return Ok((preferred, true));
    }

    match TcpListener::bind(("127.0.0.1", preferred)).await {
        Ok(listener) => {
            drop(listener);
            Ok((preferred, false))
        }
        Err(_) => {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
                RelayError::Internal(format!("failed to bind an ephemeral port: {e}"))
            })?;
            let port = listener
                .local_addr()
                .map_err(|e| RelayError::Internal(format!("failed to read local addr: {e}")))?
                .port();
            drop(listener);
            tracing::info!(
                preferred,
                port,
                "preferred port occupied by an incompatible listener, falling back"
            );
            Ok((port, false))
        }
    }
}

/// Whether a relay for `workspace` answers healthily on `port`.
async fn probe_health(port: u16, workspace: &str) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() else {
        return false;
    };
    let Ok(response) = client.get(health_url(port)).send().await else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    let Ok(body) = response.json::<Value>().await else {
        return false;
    };
    body.get("workspace").and_then(Value::as_str) == Some(workspace)
}

/// Poll the health endpoint until the relay accepts connections.
///
/// Used by the launching caller after starting a fresh instance; expiry of
/// the window is fatal to that caller.
pub async fn wait_until_ready(port: u16, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| RelayError::Internal(format!("failed to build probe client: {e}")))?;
    let url = health_url(port);
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if let Ok(response) = client.get(&url).send().await {
            if response.status().is_success() {
                return Ok(());
            }
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    Err(RelayError::Startup(timeout))
}

fn health_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/")
}
