//! Source connection for hassbridge.
//!
//! [`HassPlugin`] keeps one event channel open to a Home Assistant instance,
//! primes the runtime with metadata and a state snapshot on every
//! (re)connection, and forwards events until stopped. [`HassClient`] covers
//! the REST calls: metadata and state reads plus best-effort service calls.

mod channel;
mod client;
mod config;
mod dispatch;
mod plugin;
mod runtime;
mod tls;

pub use client::{Fetch, FetchError, HassClient, error_chain};
pub use config::{ConfigError, PluginConfig, WEBSOCKET_PATH};
pub use dispatch::dispatch;
pub use plugin::{HassPlugin, StageError, StopHandle};
pub use runtime::{PluginStarted, Runtime};
pub use tls::TlsOptions;
