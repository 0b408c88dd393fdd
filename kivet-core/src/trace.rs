//! Request-scoped trace identifiers.
//!
//! A trace id is read from the inbound `x-trace-id` header (or synthesized)
//! by the HTTP middleware, installed as a task-local for the duration of the
//! request, and forwarded by the HTTP clients on every outbound call.

use std::future::Future;

pub const TRACE_HEADER: &str = "x-trace-id";

tokio::task_local! {
    static TRACE_ID: String;
}

/// Run `fut` with `id` as the ambient trace id of the current task.
pub async fn with_trace_id<F>(id: String, fut: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(id, fut).await
}

/// The ambient trace id, if one is installed on this task.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
