//! Per-connection state within a game.

use serde::{Deserialize, Serialize};

use knights_protocol::PlayerId;

/// Queued control inputs per player slot are bounded; the worker drains
/// the queue every tick, so anything beyond a handful means the client is
/// flooding.
pub(crate) const CONTROL_QUEUE_MAX: usize = 10;

/// One client connection joined to a game.
///
/// `id2` is non-empty only for split-screen connections, which carry two
/// players on one pipe. Observers never have a second id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GameConnection {
    /// Stable handle used by the server layer to refer to this
    /// connection.
    pub conn_id: u64,

    pub id1: PlayerId,
    pub id2: PlayerId,

    /// Ready to start the game (quest-selection phase).
    pub is_ready: bool,
    /// Finished loading assets; the worker feeds no ticks until every
    /// participant has set this.
    pub finished_loading: bool,
    /// Clicked through the winner/loser screen.
    pub ready_to_end: bool,

    pub obs_flag: bool,
    pub cancel_obs_mode_after_game: bool,
    pub requires_catchup: bool,

    /// House colour index. Zero for observers, but zero is also a valid
    /// colour for players.
    pub house_colour: u8,

    pub client_version: u32,

    /// Observer number, 0 = not an observer or not allocated yet.
    pub observer_num: u32,
    /// Dense player number while a game runs. Eliminated players keep
    /// theirs; plain observers have `None`.
    pub player_num: Option<usize>,

    pub ping_time: u32,

    /// Outbound bytes awaiting collection by the server layer.
    pub output_data: Vec<u8>,

    /// Queued control numbers, one queue per player slot.
    pub control_queue: [Vec<u8>; 2],

    pub speech_request: bool,
    pub speech_bubble: bool,

    pub approach_based_controls: bool,
    pub action_bar_controls: bool,
}

impl GameConnection {
    pub fn new(
        conn_id: u64,
        id1: PlayerId,
        id2: PlayerId,
        obs_flag: bool,
        client_version: u32,
        approach_based_controls: bool,
        action_bar_controls: bool,
    ) -> Self {
        GameConnection {
            conn_id,
            id1,
            id2,
            is_ready: false,
            finished_loading: false,
            ready_to_end: false,
            obs_flag,
            cancel_obs_mode_after_game: false,
            requires_catchup: false,
            house_colour: 0,
            client_version,
            observer_num: 0,
            player_num: None,
            ping_time: 0,
            output_data: Vec::new(),
            control_queue: [Vec::new(), Vec::new()],
            speech_request: false,
            speech_bubble: false,
            approach_based_controls,
            action_bar_controls,
        }
    }

    pub fn is_split_screen(&self) -> bool {
        !self.id2.is_empty()
    }

    /// Number of players this connection carries (2 in split-screen).
    pub fn num_player_slots(&self) -> usize {
        if self.is_split_screen() {
            2
        } else {
            1
        }
    }
}
