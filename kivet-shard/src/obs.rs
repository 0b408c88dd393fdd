//! HTTP middleware: trace-id propagation and request metrics.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use kivet_core::trace::{new_trace_id, with_trace_id, TRACE_HEADER};
use metrics::{counter, histogram};

use crate::RegistrationState;

#[derive(Clone)]
pub struct ObsState {
    pub registration: Arc<RegistrationState>,
    pub shard_name: String,
    pub replica_id: String,
}

/// Install the inbound (or a fresh) trace id for the request task, stamp it
/// on the response, and record per-route latency and status counts.
pub async fn trace_and_metrics(State(obs): State<ObsState>, req: Request, next: Next) -> Response {
    let trace_id = req
        .headers()
        .get(TRACE_HEADER)
        .or_else(|| req.headers().get("x-request-id"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(new_trace_id);

    let route = req.uri().path().to_string();
    let method = req.method().to_string();
    let start = Instant::now();

    let mut response = with_trace_id(trace_id.clone(), next.run(req)).await;

    let role = obs
        .registration
        .role()
        .map(|r| r.as_str())
        .unwrap_or("unknown");
    let status = response.status().as_u16().to_string();
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(
        "http_request_latency_ms",
        "route" => route.clone(),
        "method" => method.clone(),
        "shard" => obs.shard_name.clone(),
        "replica" => obs.replica_id.clone(),
        "role" => role
    )
    .record(latency_ms);
    counter!(
        "http_requests_total",
        "route" => route,
        "method" => method,
        "status" => status,
        "shard" => obs.shard_name.clone(),
        "replica" => obs.replica_id.clone(),
        "role" => role
    )
    .increment(1);

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}
