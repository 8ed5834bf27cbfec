//! Dashboard API relay
//!
//! Receives dashboard API calls, strips hop-by-hop and client session
//! headers, and sends them through the authenticated pipeline. Backend
//! responses are returned verbatim, error statuses included. Only terminal
//! session failures and transport failures are answered by the relay itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use authed_client::{Error as ClientError, RequestDescriptor, RequestPipeline};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, instrument, warn};

use crate::metrics;

/// Inbound body limit
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip in both directions (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers the relay owns: credentials come from the store, host and
/// framing from the backend connection.
const RELAY_OWNED_HEADERS: &[&str] = &["authorization", "cookie", "host", "content-length"];

/// Shared state passed to the relay handler
#[derive(Clone)]
pub struct RelayState {
    pub pipeline: Arc<RequestPipeline>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Relay one inbound request to the backend through the pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn relay_request(
    state: &RelayState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &RelayState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_stripped(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let mut descriptor = RequestDescriptor::new(request.method().clone(), path).with_headers(headers);

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return fail(
                state,
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };
    if !body.is_empty() {
        descriptor = descriptor.with_body(body);
    }

    match state.pipeline.send(descriptor).await {
        Ok(upstream) => {
            if !upstream.is_success() {
                debug!(status = upstream.status().as_u16(), "relaying backend error status");
            }
            let mut response = Response::builder().status(upstream.status());
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.into_body()))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "relay_error",
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(e) if e.is_auth_terminal() => {
            warn!(error = %e, "session could not be renewed");
            fail(
                state,
                StatusCode::UNAUTHORIZED,
                "session_expired",
                "session expired, sign in again",
                request_id,
            )
        }
        Err(ClientError::Timeout(msg)) => {
            error!(error = %msg, "backend timeout");
            fail(
                state,
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                &format!("backend timeout: {msg}"),
                request_id,
            )
        }
        Err(ClientError::InvalidRequest(msg)) => fail(
            state,
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &msg,
            request_id,
        ),
        Err(e) => {
            error!(error = %e, "backend request failed");
            fail(
                state,
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("backend error: {e}"),
                request_id,
            )
        }
    }
}

fn fail(
    state: &RelayState,
    status: StatusCode,
    kind: &'static str,
    message: &str,
    request_id: &str,
) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    metrics::record_error(kind);
    error_response(status, kind, message, request_id)
}

fn is_stripped(name: &str) -> bool {
    is_hop_by_hop(name)
        || RELAY_OWNED_HEADERS
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
