//! Reliable-ordered byte pipes for Knights.
//!
//! The protocol layers only require a reliable, ordered packet pipe: one
//! outbound packet arrives as one inbound packet, in order, or the
//! connection dies. [`WsListener`] / [`ws_connect`] provide that over
//! WebSocket binary frames, and [`pipe`] provides an in-memory pair for
//! deterministic tests.

mod error;
mod pipe;
mod websocket;

pub use error::TransportError;
pub use pipe::{pipe, PipeConn};
pub use websocket::{ws_connect, WsConn, WsListener};

use std::future::Future;

/// One end of a reliable-ordered packet pipe.
pub trait PacketConn: Send + Sync + 'static {
    /// Sends one packet. Completion means the packet was queued, not
    /// acknowledged.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next packet; `None` means the peer closed cleanly.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the pipe. Further sends fail; the peer's `recv` returns
    /// `None`.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
