//! Engine boundary for the Knights session server.
//!
//! The quest rule engine that simulates knights and monsters is an external
//! collaborator; the session core only ever talks to it through the
//! [`GameEngine`] trait and reports back through the view-sink traits
//! ([`DungeonView`], [`MiniMap`], [`StatusDisplay`]) grouped behind
//! [`KnightsCallbacks`]. This crate defines those seams, the per-game
//! [`GameConfig`] (asset tables, menu, quest constraints, house colours),
//! and a small deterministic arena engine used by the server binary and the
//! test suites to exercise the interface.

mod arena;
mod config;
mod engine;
mod views;

pub use arena::{ArenaEngine, ArenaFactory};
pub use config::{
    GameConfig, Manifest, MenuChoice, MenuChoiceValue, MenuItem, MenuListener, MenuState,
};
pub use engine::{
    EngineError, EngineFactory, EngineParams, EngineStart, GameEngine, PlayerInfo, PlayerState,
};
pub use views::{
    DungeonView, KnightsCallbacks, MapDirection, MapHeight, MiniMap, MiniMapColour, MotionType,
    PotionMagic, StatusDisplay, TutorialWindow,
};
