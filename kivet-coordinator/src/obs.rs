//! HTTP middleware: trace-id propagation and request metrics.

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use kivet_core::trace::{new_trace_id, with_trace_id, TRACE_HEADER};
use metrics::{counter, histogram};

/// Install the inbound (or a fresh) trace id for the request task, stamp it
/// on the response, and record per-route latency and status counts. The
/// task-local id is what the shard client forwards downstream.
pub async fn trace_and_metrics(req: Request, next: Next) -> Response {
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

    let status = response.status().as_u16().to_string();
    histogram!(
        "http_request_latency_ms",
        "route" => route.clone(),
        "method" => method.clone()
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
    counter!(
        "http_requests_total",
        "route" => route,
        "method" => method,
        "status" => status
    )
    .increment(1);

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}
