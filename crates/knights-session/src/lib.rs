//! Game sessions: one `KnightsGame` per running game.
//!
//! A session owns its connection roster, the quest-selection state
//! machine, and (while a quest runs) the engine plus a simulation worker.
//! Two driving modes share one core:
//!
//! - **Threaded** (native servers): the worker is a dedicated OS thread.
//!   A single mutex covers all mutable session state and a condition
//!   variable wakes the worker promptly when input arrives.
//! - **Cooperative** (the replicated VM): no threads; the host calls
//!   [`KnightsGame::pump`] at explicit points and the worker state machine
//!   resumes from where it yielded. The clock only advances when the host
//!   says so, keeping the simulation deterministic.

mod clock;
mod connection;
mod error;
mod game;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SessionError;
pub use game::{GameSnapshot, KnightsGame, WorkerMode};

/// Player-list refresh cadence while a game runs.
pub const PLAYER_LIST_INTERVAL_MS: u64 = 3000;

/// How long the winner/loser screen may stay up before the session forces
/// everyone back to the quest-selection menu.
pub const FORCE_QUIT_TIMEOUT_MS: u64 = 60_000;
