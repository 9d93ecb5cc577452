//! View-sink traits: how the engine reports what happened during an update.
//!
//! The engine is handed one [`KnightsCallbacks`] per update call and pushes
//! everything a client might need to redraw through it. The server-side
//! implementations (in `knights-view`) translate these calls into wire
//! bytes per observer; a hypothetical local client could implement them
//! directly against a renderer.

use serde::{Deserialize, Serialize};

use knights_protocol::{ColourChange, LocalMsg, PlayerId};

// ---------------------------------------------------------------------------
// Small map enums
// ---------------------------------------------------------------------------

/// Facing / movement direction on the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MapDirection {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl MapDirection {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MapDirection::North),
            1 => Some(MapDirection::East),
            2 => Some(MapDirection::South),
            3 => Some(MapDirection::West),
            _ => None,
        }
    }
}

/// Height at which an entity is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MapHeight {
    Underneath = 0,
    Walking = 1,
    Flying = 2,
}

/// How an entity is currently moving between squares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionType {
    NotMoving = 0,
    Moving = 1,
    Approaching = 2,
    Withdrawing = 3,
}

/// Colour of one mini-map square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MiniMapColour {
    Wall = 0,
    Floor = 1,
    Unmapped = 2,
}

/// Potion-magic indicator shown in the status area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PotionMagic {
    NoPotion = 0,
    Healing = 1,
    Strength = 2,
    Quickness = 3,
    Invisibility = 4,
    Paralyzation = 5,
    Poison = 6,
}

/// One window of tutorial text, used by `pop_up_window` in one-player
/// games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorialWindow {
    pub title: LocalMsg,
    pub msg: LocalMsg,
    pub popup: bool,
    pub gfx: Vec<u32>,
    pub cc: Vec<ColourChange>,
}

// ---------------------------------------------------------------------------
// DungeonView
// ---------------------------------------------------------------------------

/// Sink for dungeon-view updates of one player's display.
///
/// Room coordinates are in 0..15 (they are transmitted as nibbles).
/// Tile and item updates carry a `force` flag requesting unconditional
/// emission even for squares the observer has already seen.
pub trait DungeonView {
    fn set_current_room(&mut self, room: u32, width: u8, height: u8);

    #[allow(clippy::too_many_arguments)]
    fn add_entity(
        &mut self,
        id: u16,
        x: u8,
        y: u8,
        height: MapHeight,
        facing: MapDirection,
        anim: u32,
        overlay: u32,
        anim_frame: u8,
        anim_tzero_diff: i16,
        anim_invuln: bool,
        cur_ofs: u16,
        motion: MotionType,
        motion_time_remaining: u16,
        name: &PlayerId,
    );
    fn rm_entity(&mut self, id: u16);
    fn reposition_entity(&mut self, id: u16, x: u8, y: u8);
    fn move_entity(&mut self, id: u16, motion: MotionType, motion_duration: u16, missile_mode: bool);
    fn flip_entity_motion(&mut self, id: u16, initial_delay: u16, motion_duration: u16);

    #[allow(clippy::too_many_arguments)]
    fn set_anim_data(
        &mut self,
        id: u16,
        anim: u32,
        overlay: u32,
        anim_frame: u8,
        anim_tzero_diff: i16,
        anim_invuln: bool,
        currently_moving: bool,
    );
    fn set_facing(&mut self, id: u16, facing: MapDirection);
    fn set_speech_bubble(&mut self, id: u16, show: bool);

    fn clear_tiles(&mut self, x: u8, y: u8, force: bool);
    fn set_tile(
        &mut self,
        x: u8,
        y: u8,
        depth: i8,
        gfx: u32,
        cc: Option<&ColourChange>,
        force: bool,
    );
    fn set_item(&mut self, x: u8, y: u8, gfx: u32, force: bool);
    fn place_icon(&mut self, x: u8, y: u8, gfx: u32, duration_ms: u16);

    fn flash_message(&mut self, msg: &LocalMsg, ntimes: u8);
    fn cancel_continuous_messages(&mut self);
    fn add_continuous_message(&mut self, msg: &LocalMsg);
}

// ---------------------------------------------------------------------------
// MiniMap
// ---------------------------------------------------------------------------

/// Sink for mini-map updates of one player's display.
pub trait MiniMap {
    fn set_size(&mut self, width: u8, height: u8);
    fn set_colour(&mut self, x: u8, y: u8, col: MiniMapColour);
    fn wipe_map(&mut self);
    /// `None` position means the knight's location is no longer known.
    fn map_knight_location(&mut self, n: u8, pos: Option<(u8, u8)>);
    fn map_item_location(&mut self, x: u8, y: u8, on: bool);
}

// ---------------------------------------------------------------------------
// StatusDisplay
// ---------------------------------------------------------------------------

/// Sink for status-area updates of one player's display.
pub trait StatusDisplay {
    fn set_backpack(&mut self, slot: u8, gfx: u32, overdraw_gfx: u32, no_carried: u8, no_max: u8);
    fn add_skull(&mut self);
    fn set_health(&mut self, health: u32);
    fn set_potion_magic(&mut self, potion_magic: PotionMagic, poison_immunity: bool);
    fn set_quest_hints(&mut self, hints: &[LocalMsg]);
}

// ---------------------------------------------------------------------------
// KnightsCallbacks
// ---------------------------------------------------------------------------

/// Grouped view sink handed to the engine for each update.
///
/// Player numbers are the dense `[0, N)` indices assigned at game start.
pub trait KnightsCallbacks {
    fn dungeon_view(&mut self, player: usize) -> &mut dyn DungeonView;
    fn mini_map(&mut self, player: usize) -> &mut dyn MiniMap;
    fn status_display(&mut self, player: usize) -> &mut dyn StatusDisplay;

    fn play_sound(&mut self, player: usize, sound: u32, frequency: u32);

    fn win_game(&mut self, player: usize);
    fn lose_game(&mut self, player: usize);

    /// `controls` pairs a control id with its primary flag.
    fn set_available_controls(&mut self, player: usize, controls: &[(u8, bool)]);
    fn set_menu_highlight(&mut self, player: usize, control: u8);
    fn flash_screen(&mut self, player: usize, delay_ms: u32);

    /// `player == None` sends to all players.
    fn game_msg(&mut self, player: Option<usize>, msg: &LocalMsg, is_err: bool);
    fn pop_up_window(&mut self, windows: &[TutorialWindow]);

    /// Reports that a player has been knocked out of the quest; the
    /// session moves them into observer mode on the next update.
    fn on_elimination(&mut self, player: usize);
    fn disable_view(&mut self, player: usize);

    /// Clears the caches for one player's displays ahead of a catch-up
    /// re-emission.
    fn prepare_for_catch_up(&mut self, player: usize);
}
