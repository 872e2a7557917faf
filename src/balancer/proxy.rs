//! Request forwarding.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http::StatusCode;
use log::{debug, warn};

use crate::balancer::Balancer;

/// Response header naming the upstream that served the request.
pub const TRACE_HEADER: &str = "lb-from";

/// Body size cap for buffered forwarding of incoming request bodies.
const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

pub fn router(balancer: Arc<Balancer>) -> Router {
    Router::new().fallback(forward).with_state(balancer)
}

/// Holds an upstream's connection count up for exactly as long as the
/// request is in flight, including while the response body streams out.
struct ConnGuard(Arc<AtomicI64>);

impl ConnGuard {
    fn acquire(counter: Arc<AtomicI64>) -> ConnGuard {
        counter.fetch_add(1, Ordering::Relaxed);
        ConnGuard(counter)
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn forward(State(balancer): State<Arc<Balancer>>, request: Request) -> Response {
    let Some(target) = balancer.pick() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no healthy upstreams\n").into_response();
    };
    let guard = ConnGuard::acquire(Arc::clone(&target.active_conns));

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("failed to read request body: {err}");
            return (StatusCode::BAD_REQUEST, "unreadable request body\n").into_response();
        }
    };

    let mut url = target.base.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut headers = parts.headers;
    headers.remove(HOST);

    debug!("{} {} -> {}", parts.method, parts.uri, target.addr);
    let upstream_response = match balancer
        .client()
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!("upstream {} failed: {err}", target.addr);
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {err}\n"))
                .into_response();
        }
    };

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    if balancer.trace() {
        if let Ok(value) = HeaderValue::from_str(&target.addr) {
            headers.insert(HeaderName::from_static(TRACE_HEADER), value);
        }
    }

    // The guard rides along with the body stream so the connection count
    // drops only once the response has been fully relayed (or abandoned).
    let stream = upstream_response.bytes_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
