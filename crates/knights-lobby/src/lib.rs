//! Host-migratable lobbies.
//!
//! A lobby is a container for a Knights game. [`SimpleLobby`] hosts a
//! plain in-process server. [`VmLobby`] hosts the replicated variant: a
//! deterministic VM kept in step across peers by a tick stream, with the
//! leader role migrating when the platform lobby reports a new leader.
//! Late joiners receive the leader's VM memory as hashed, compressed
//! blocks interleaved with catch-up ticks ([`SyncHost`] / [`SyncClient`]),
//! and both sides compare checksums afterwards to catch divergence.

mod compress;
mod error;
mod follower;
mod leader;
mod lobby;
mod sync_client;
mod sync_host;

pub use compress::{BlockCompressor, BlockDecompressor};
pub use error::LobbyError;
pub use follower::FollowerState;
pub use leader::LeaderState;
pub use lobby::{KnightsLobby, LobbyController, LobbyState, PlatformLobby, SimpleLobby, VmLobby};
pub use sync_client::SyncClient;
pub use sync_host::SyncHost;

/// Hard cap on follower connections to one leader.
pub const MAX_FOLLOWERS: usize = 20;

/// Flush delay when the pending tick batch contains output for clients.
pub const SHORT_FLUSH_DELAY_MS: u64 = 30;

/// Flush delay when the pending tick batch is input-only.
pub const LONG_FLUSH_DELAY_MS: u64 = 500;

/// Cadence of `ClientPingReport` records written by the leader.
pub const PING_UPDATE_INTERVAL_MS: u64 = 3000;
