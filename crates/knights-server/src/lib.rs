//! The multi-game Knights server.
//!
//! A `KnightsServer` hosts many concurrent games. It owns every
//! `ServerConnection`, performs the client handshake (version string,
//! player id, optional password), routes decoded messages into the right
//! session, and maintains the server-wide player list and game directory.
//!
//! Access to the `KnightsServer` itself is single-threaded: the native
//! server drives it from its top-level network task, and the replicated VM
//! drives it from tick callbacks. The games it owns run their own
//! simulation workers (or are pumped cooperatively inside the VM).

mod connection;
mod error;
mod loader;
mod server;

pub use error::ServerError;
pub use loader::ConfigLoader;
pub use server::{KnightsServer, ServerParams, ServerSnapshot};

/// Failed password attempts allowed before the connection is frozen.
pub const MAX_PASSWORD_ATTEMPTS: u32 = 5;

/// Outbound delivery is suspended for this long after a wrong password.
pub const PASSWORD_RETRY_DELAY_MS: u64 = 2000;

/// Per-connection inbound budget per rate window; flooding past this is a
/// protocol error.
pub const RATE_LIMIT_BYTES: u32 = 64 * 1024;
pub const RATE_LIMIT_WINDOW_MS: u64 = 1000;
