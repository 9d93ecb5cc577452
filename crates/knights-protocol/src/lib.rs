//! Wire protocol for the Knights client/server system.
//!
//! Everything that travels between a Knights client and server is a flat
//! little-endian byte stream: one-byte message codes followed by the fields
//! documented on each code. This crate owns the primitive codec
//! ([`InputByteBuf`] / [`OutputByteBuf`]), the message-code tables, and the
//! shared wire types (player ids, localized messages, colours, controls and
//! the asset-table entries sent in `JoinGameAccepted`).
//!
//! The higher layers (session, server, lobby) never touch raw bytes except
//! through this crate.

mod buffer;
mod client;
mod codes;
mod error;
mod localization;
mod tables;
mod types;

pub use buffer::{InputByteBuf, OutputByteBuf, PayloadSizeMark};
pub use client::ClientCommands;
pub use codes::{
    client_msg, ext_msg, follower_msg, leader_msg, server_msg, ChatKind, PlayerListState,
    HOST_MIGRATION_BLOCK_SHIFT, HOST_MIGRATION_BLOCK_SIZE_BYTES,
};
pub use error::ProtocolError;
pub use localization::{read_local_msg, write_local_msg, LocalKey, LocalMsg, LocalParam};
pub use tables::{Anim, Graphic, Overlay, Sound};
pub use types::{
    Colour, ColourChange, ControlByte, GameInfo, GameStatus, PlayerId, UserControl,
    NUM_STANDARD_CONTROLS,
};

/// Version string prefix expected as the first bytes from every client.
pub const VERSION_STRING_PREFIX: &str = "Knights/";

/// Protocol version implemented by this server.
pub const PROTOCOL_VERSION: u32 = 18;

/// Oldest client protocol version still accepted.
pub const COMPATIBLE_VERSION: u32 = 16;

/// Formats the version string a client sends on connect, e.g. `Knights/018`.
pub fn version_string(version: u32) -> String {
    format!("{VERSION_STRING_PREFIX}{version:03}")
}
