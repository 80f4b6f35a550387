//! Event dispatch into the runtime.

use crate::runtime::Runtime;
use serde_json::Value;

/// Forward one event payload to the runtime's state-update entry point,
/// tagged with `namespace`. No filtering or buffering: if the runtime is
/// slow, the caller waits.
pub async fn dispatch<R: Runtime>(runtime: &R, namespace: &str, event: Value) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let kind = event.get("event_type").and_then(Value::as_str).unwrap_or("?");
        tracing::trace!("dispatching {} event to namespace {}", kind, namespace);
    }
    runtime.state_update(namespace, event).await;
}
