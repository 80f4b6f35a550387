//! Core types for hassbridge.
//!
//! This crate holds the protocol primitives shared by the source connection
//! and the client stream: event-channel frames, service metadata, state
//! snapshots and credentials. It performs no I/O.

mod credential;
mod frame;
mod metadata;
mod service;
mod session;
mod snapshot;

pub use credential::Credential;
pub use frame::{Frame, OutboundFrame};
pub use metadata::{Metadata, MetadataError};
pub use service::{ServiceName, ServiceNameError};
pub use session::SessionId;
pub use snapshot::{Snapshot, SnapshotError};

use std::fmt;

/// Connection lifecycle state of the source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not running, or halted after a stop request.
    #[default]
    Idle,
    /// Opening the socket.
    Connecting,
    /// Exchanging the auth handshake.
    Authenticating,
    /// Waiting for the subscribe result.
    Subscribing,
    /// Fetching metadata and the state snapshot.
    Priming,
    /// Forwarding events.
    Streaming,
    /// Connection lost, waiting to retry.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Priming => "priming",
            Self::Streaming => "streaming",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
