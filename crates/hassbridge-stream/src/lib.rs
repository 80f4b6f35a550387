//! Client stream for hassbridge.
//!
//! Dashboard clients connect over WebSocket; the [`Multiplexer`] keeps one
//! record per session and routes messages in both directions by session id.

mod mux;
mod websocket;

pub use mux::{
    ClientSession, Multiplexer, SessionHandler, SessionTransport, StreamHub, TransportError,
};
pub use websocket::serve;
