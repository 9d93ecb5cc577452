//! Per-connection state on the server.

use serde::{Deserialize, Serialize};

use knights_protocol::PlayerId;

/// One client connection to the server.
///
/// Invariant: `game_name` and `game_conn_id` are both set or both unset;
/// a connection is joined to at most one game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServerConn {
    /// Unique monotonic id, used in log lines.
    pub unique_id: u64,

    /// Remote address (for logging; empty for local/in-VM connections).
    pub addr: String,

    /// Identity asserted by the platform layer; when non-empty, the
    /// client's `SetPlayerId` must match it.
    pub platform_user_id: PlayerId,

    /// Identity accepted from `SetPlayerId`; empty until then.
    pub player_id: PlayerId,

    pub output_data: Vec<u8>,

    /// Output is withheld until this time; used for the password-retry
    /// back-off. `None` = not waiting.
    pub wait_until: Option<u64>,

    pub client_version: u32,
    pub version_string_received: bool,

    /// Player id (and password, if applicable) accepted.
    pub connection_accepted: bool,

    pub failed_password_attempts: u32,

    /// An error has been sent; don't overwrite it with a generic
    /// access-denied one.
    pub error_sent: bool,

    /// The connection misbehaved; the owner should close it after
    /// flushing its output.
    pub close_scheduled: bool,

    // control schemes, forwarded into games on join
    pub approach_based_controls: bool,
    pub action_bar_controls: bool,

    pub game_name: Option<String>,
    pub game_conn_id: Option<u64>,

    // inbound rate-limit watermark
    pub rate_window_start: u64,
    pub rate_bytes: u32,
}

impl ServerConn {
    pub fn new(unique_id: u64, addr: String, platform_user_id: PlayerId) -> Self {
        ServerConn {
            unique_id,
            addr,
            platform_user_id,
            player_id: PlayerId::default(),
            output_data: Vec::new(),
            wait_until: None,
            client_version: 0,
            version_string_received: false,
            connection_accepted: false,
            failed_password_attempts: 0,
            error_sent: false,
            close_scheduled: false,
            approach_based_controls: true,
            action_bar_controls: false,
            game_name: None,
            game_conn_id: None,
            rate_window_start: 0,
            rate_bytes: 0,
        }
    }

    pub fn in_game(&self) -> bool {
        self.game_name.is_some()
    }
}
