//! Round-robin reverse proxy in front of the worker pool.
//!
//! Every inbound request goes to the next worker in cyclic order, without
//! looking at whether that worker is alive. A worker that cannot be reached
//! costs the client one `502`; the request is never retried elsewhere.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::worker_port;
use crate::error::StartupError;

/// Cyclic worker selection over ids `1..=len`.
#[derive(Debug)]
pub struct RoundRobin {
    cursor: AtomicUsize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            len: len.max(1),
        }
    }

    /// Index of the selected worker, advancing the cursor.
    pub fn next(&self) -> usize {
        let len = self.len;
        match self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some((c + 1) % len))
        {
            Ok(current) | Err(current) => current,
        }
    }
}

pub struct ProxyState {
    balancer: RoundRobin,
    /// `ports[i]` belongs to the worker with id `i + 1`.
    ports: Vec<u16>,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(base_port: u16, workers: u16) -> Result<Self, StartupError> {
        let ports = (1..=workers)
            .map(|id| worker_port(base_port, id))
            .collect::<Result<Vec<_>, _>>()?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(StartupError::ProxyClient)?;
        Ok(Self {
            balancer: RoundRobin::new(ports.len()),
            ports,
            client,
        })
    }

    /// Picks the next worker: `(worker_id, port)`.
    fn select(&self) -> (u16, u16) {
        let index = self.balancer.next();
        let worker_id = u16::try_from(index + 1).unwrap_or(u16::MAX);
        (worker_id, self.ports[index])
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (worker_id, port) = state.select();
    debug!(worker_id, port, method = %request.method(), uri = %request.uri(), "routing request");

    match send_upstream(&state.client, port, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(worker_id, port, error = %err, "worker unreachable");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "message": format!("Error proxying to worker {worker_id}: {err}")
                })),
            )
                .into_response()
        }
    }
}

async fn send_upstream(
    client: &reqwest::Client,
    port: u16,
    request: Request,
) -> Result<Response, reqwest::Error> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{port}{path}");

    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let mut upstream = client.request(parts.method, url).headers(headers);
    if has_body {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let upstream = upstream.send().await?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
