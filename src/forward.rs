//! Forwarding engine: executes the outbound gateway call and classifies the
//! reply.
//!
//! Buffered replies are mirrored verbatim. Streamed replies hand the open
//! upstream response back to the server layer, which relays its byte stream
//! chunk-by-chunk — the full body is never held in memory.

use std::time::Duration;

use axum::body::Bytes;

use crate::error::{RelayError, Result};
use crate::transform::OutboundRequest;

/// Total bound on one upstream call. Generous because slow model generations
/// are expected; it only exists to cap a genuine hang.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(180);

/// Build the shared upstream client. Constructed once per relay instance.
pub fn upstream_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .map_err(|e| RelayError::Internal(format!("failed to build upstream client: {e}")))
}

/// A successful upstream reply.
#[derive(Debug)]
pub enum UpstreamReply {
    /// Fully buffered response, mirrored to the caller as-is.
    Buffered {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    /// Open event-stream response; the body is still on the wire.
    Stream(reqwest::Response),
}

/// Execute one outbound request.
///
/// Non-2xx upstream statuses are not transport failures: they come back as
/// [`RelayError::Gateway`] carrying the verbatim status and body so the
/// caller sees the real cause. Timeouts map to [`RelayError::Timeout`] and
/// connection-level failures to [`RelayError::Transport`]; the relay never
/// retries.
pub async fn forward(
    client: &reqwest::Client,
    outbound: OutboundRequest,
    streaming: bool,
) -> Result<UpstreamReply> {
    let response = client
        .post(&outbound.url)
        .headers(outbound.headers)
        .body(outbound.body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let content_type = content_type_of(&response);
        let body = response.bytes().await?;
        tracing::error!(
            status = status.as_u16(),
            bytes = body.len(),
            "gateway returned an error response"
        );
        return Err(RelayError::Gateway {
            status: status.as_u16(),
            content_type,
            body,
        });
    }

    if streaming {
        tracing::info!(status = status.as_u16(), "relaying gateway event stream");
        return Ok(UpstreamReply::Stream(response));
    }

    let content_type = content_type_of(&response);
    let body = response.bytes().await?;
    tracing::info!(
        status = status.as_u16(),
        bytes = body.len(),
        "gateway call succeeded"
    );
    Ok(UpstreamReply::Buffered {
        status: status.as_u16(),
        content_type,
        body,
    })
}

fn content_type_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    use super::*;
    use crate::transform::build_outbound;

    fn outbound_to(server: &MockServer) -> OutboundRequest {
        build_outbound(
            &server.base_url(),
            "/serving-endpoints/anthropic/v1/messages",
            &HeaderMap::new(),
            "dbx-token",
            Bytes::from_static(br#"{"stream":false}"#),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_is_buffered_with_mirrored_metadata() {
        let server = MockServer::start();
        let upstream = server.mock(|when, then| {
            when.method(POST)
                .path("/serving-endpoints/anthropic/v1/messages")
                .header("authorization", "Bearer dbx-token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"msg_1","content":[]}"#);
        });

        let client = upstream_client().unwrap();
        let reply = forward(&client, outbound_to(&server), false).await.unwrap();

        match reply {
            UpstreamReply::Buffered {
                status,
                content_type,
                body,
            } => {
                assert_eq!(status, 200);
                assert_eq!(content_type.as_deref(), Some("application/json"));
                assert_eq!(body.as_ref(), br#"{"id":"msg_1","content":[]}"#);
            }
            UpstreamReply::Stream(_) => panic!("expected a buffered reply"),
        }
        upstream.assert_hits(1);
    }

    #[tokio::test]
    async fn non_2xx_becomes_gateway_error_with_verbatim_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/serving-endpoints/anthropic/v1/messages");
            then.status(429)
                .header("content-type", "application/json")
                .body(r#"{"error":"rate limited"}"#);
        });

        let client = upstream_client().unwrap();
        let err = forward(&client, outbound_to(&server), false)
            .await
            .unwrap_err();

        match err {
            RelayError::Gateway {
                status,
                content_type,
                body,
            } => {
                assert_eq!(status, 429);
                assert_eq!(content_type.as_deref(), Some("application/json"));
                assert_eq!(body.as_ref(), br#"{"error":"rate limited"}"#);
            }
            other => panic!("expected Gateway error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_maps_to_transport_error() {
        // Bind and drop to find a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let outbound = build_outbound(
            &dead_url,
            "/serving-endpoints/anthropic/v1/messages",
            &HeaderMap::new(),
            "dbx-token",
            Bytes::new(),
        )
        .unwrap();

        let client = upstream_client().unwrap();
        let err = forward(&client, outbound, false).await.unwrap_err();
        assert_eq!(err.error_type(), "connection_error");
    }
}
