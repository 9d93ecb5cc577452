//! The `GameEngine` trait: the session core's view of the quest rule
//! engine.

use serde::{Deserialize, Serialize};

use knights_protocol::{Colour, LocalMsg, PlayerId, UserControl};

use crate::views::KnightsCallbacks;

/// In-quest state of one player slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    Normal,
    Eliminated,
    /// The player's connection dropped; their knight is out of the quest
    /// but their score line stays visible in case they reconnect.
    Disconnected,
}

/// One row of the in-game player list, sorted by house colour then id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub house_colour: Colour,
    pub house_colour_index: u8,
    pub player_num: usize,
    pub kills: u32,
    pub deaths: u32,
    /// Score for deathmatch quests.
    pub frags: i32,
    pub state: PlayerState,
}

/// Failure starting or restoring an engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Startup failed in a recoverable way; the session announces the
    /// message and returns to quest selection.
    #[error("engine startup failed: {}", .0.key)]
    Startup(LocalMsg),

    /// A saved engine state could not be reconstructed.
    #[error("engine state corrupt")]
    BadSaveState,
}

/// Everything a freshly started engine hands back to the session.
pub struct EngineStart {
    pub engine: Box<dyn GameEngine>,
    pub deathmatch: bool,
    /// Startup messages (quest intro etc.) to announce to all players.
    pub messages: Vec<LocalMsg>,
}

/// Parameters for creating an engine.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// House-colour index per player number.
    pub house_colours: Vec<u8>,
    /// Player id per player number. Empty ids are allowed (split-screen
    /// games suppress the on-screen names).
    pub player_ids: Vec<PlayerId>,
    /// Current menu settings, keyed by item key.
    pub menu_settings: Vec<(String, i32)>,
    /// Seed for all in-engine randomness. Replicas must receive the same
    /// seed to stay in step.
    pub rng_seed: u64,
}

/// Creates engines for a particular quest ruleset.
pub trait EngineFactory: Send + Sync {
    fn create(&self, params: EngineParams) -> Result<EngineStart, EngineError>;

    /// Rebuilds an engine from bytes produced by
    /// [`GameEngine::save_state`].
    fn restore(&self, state: &[u8]) -> Result<Box<dyn GameEngine>, EngineError>;
}

/// A running quest simulation.
///
/// The engine is deterministic: its state advances only through
/// [`update`](Self::update) and the input methods, and all randomness
/// derives from the seed in [`EngineParams`]. Given the same seed and the
/// same call sequence, two engines produce identical callback sequences
/// and identical [`save_state`](Self::save_state) bytes.
pub trait GameEngine: Send {
    /// Runs one update step of `time_delta_ms`, reporting everything that
    /// happened through `callbacks`.
    fn update(&mut self, time_delta_ms: u32, callbacks: &mut dyn KnightsCallbacks);

    /// How long until the next update is required, in ms.
    fn time_to_next_update_ms(&self) -> u32;

    /// Applies a control input. `None` releases the current control.
    fn set_control(&mut self, player: usize, control: Option<&UserControl>);
    fn set_approach_based_controls(&mut self, player: usize, flag: bool);
    fn set_action_bar_controls(&mut self, player: usize, flag: bool);
    fn set_speech_bubble(&mut self, player: usize, show: bool);

    /// Re-emits every currently visible tile, mini-map cell and status
    /// field for one player, through the callbacks. Used to bring a new
    /// observer or a reconnecting player up to date.
    fn catch_up(&mut self, player: usize, callbacks: &mut dyn KnightsCallbacks);

    /// Number of players still actively in the quest.
    fn num_players_remaining(&self) -> usize;

    fn change_player_state(&mut self, player: usize, state: PlayerState);

    fn player_list(&self) -> Vec<PlayerInfo>;

    /// True if something happened (a death, usually) that warrants an
    /// immediate player-list refresh. Reading the flag clears it.
    fn take_player_list_dirty(&mut self) -> bool;

    /// Milliseconds left on the quest time limit, or `None` if there is
    /// no limit.
    fn time_remaining_ms(&self) -> Option<u32>;

    /// Serializes the full engine state for the replicated VM snapshot.
    /// The encoding must be canonical: equal states produce equal bytes.
    fn save_state(&self) -> Vec<u8>;
}
