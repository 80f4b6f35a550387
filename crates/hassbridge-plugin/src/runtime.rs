//! The automation runtime, as seen from the source connection.

use hassbridge_core::{Metadata, Snapshot};
use serde_json::Value;
use std::future::Future;

/// Everything the runtime learns when a connection finishes priming.
#[derive(Debug, Clone)]
pub struct PluginStarted {
    pub name: String,
    pub namespace: String,
    pub metadata: Metadata,
    pub snapshot: Snapshot,
    /// `true` for the first start since the plugin began running,
    /// `false` after a reconnect.
    pub first_time: bool,
}

/// Callbacks consumed by the connection state machine.
///
/// Calls are made from the single task driving the connection, in order.
/// A slow `state_update` holds back the read loop with it.
pub trait Runtime: Send + Sync + 'static {
    fn plugin_started(&self, started: PluginStarted) -> impl Future<Output = ()> + Send;

    fn plugin_stopped(&self, name: &str, namespace: &str) -> impl Future<Output = ()> + Send;

    fn state_update(&self, namespace: &str, event: Value) -> impl Future<Output = ()> + Send;
}
