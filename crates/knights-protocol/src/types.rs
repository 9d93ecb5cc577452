//! Shared wire types: player identity, game directory entries, colours,
//! colour changes and user controls.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{InputByteBuf, OutputByteBuf, ProtocolError};

// ---------------------------------------------------------------------------
// PlayerId
// ---------------------------------------------------------------------------

/// Opaque string identity of a player.
///
/// On online platforms this is the platform user id (qualified by a
/// platform namespace); on plain servers it is the player's chosen name.
/// Equality is byte-exact; the empty id means "unidentified".
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        PlayerId(id.into())
    }

    /// Identity qualified by a platform namespace, e.g. `steam/7656...`.
    pub fn platform_qualified(platform: &str, user: &str) -> Self {
        PlayerId(format!("{platform}/{user}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Game directory
// ---------------------------------------------------------------------------

/// Status byte in `UpdateGame` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameStatus {
    WaitingForPlayers = 0,
    SelectingQuest = 1,
    Running = 2,
}

impl GameStatus {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(GameStatus::WaitingForPlayers),
            1 => Ok(GameStatus::SelectingQuest),
            2 => Ok(GameStatus::Running),
            _ => Err(ProtocolError::OutOfRange("game status")),
        }
    }
}

/// One entry of the server-wide game directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub game_name: String,
    pub num_players: u32,
    pub num_observers: u32,
    pub status: GameStatus,
}

// ---------------------------------------------------------------------------
// Colours
// ---------------------------------------------------------------------------

/// An RGBA colour.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Colour {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Colour { r, g, b, a: 255 }
    }

    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_ubyte(self.r);
        buf.write_ubyte(self.g);
        buf.write_ubyte(self.b);
        buf.write_ubyte(self.a);
    }

    pub fn deserialize(buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        Ok(Colour {
            r: buf.read_ubyte()?,
            g: buf.read_ubyte()?,
            b: buf.read_ubyte()?,
            a: buf.read_ubyte()?,
        })
    }
}

/// A palette substitution applied to a graphic, e.g. to recolour a knight
/// into its house colour. Kept sorted on the source colour at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColourChange {
    mappings: Vec<(Colour, Colour)>,
}

impl ColourChange {
    pub fn new() -> Self {
        ColourChange::default()
    }

    /// True if all colours pass through unmodified.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn add(&mut self, old_col: Colour, new_col: Colour) {
        self.mappings.push((old_col, new_col));
        self.mappings.sort();
    }

    /// `None` if the source colour is to be left unchanged.
    pub fn lookup(&self, old_col: Colour) -> Option<Colour> {
        self.mappings
            .binary_search_by(|(from, _)| from.cmp(&old_col))
            .ok()
            .map(|i| self.mappings[i].1)
    }

    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_var_int(self.mappings.len() as u32);
        for (from, to) in &self.mappings {
            from.serialize(buf);
            to.serialize(buf);
        }
    }

    pub fn deserialize(buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        let num = buf.read_var_int()? as usize;
        let mut mappings = Vec::with_capacity(num);
        for _ in 0..num {
            let from = Colour::deserialize(buf)?;
            let to = Colour::deserialize(buf)?;
            mappings.push((from, to));
        }
        Ok(ColourChange { mappings })
    }
}

// ---------------------------------------------------------------------------
// User controls
// ---------------------------------------------------------------------------

/// Number of standard controls with fixed ids (attack, four move
/// directions, withdraw, etc.). Control ids start at 1.
pub const NUM_STANDARD_CONTROLS: u32 = 10;

/// One user control (attack / move direction / action-bar slot / ...).
///
/// The full table is sent to clients in `JoinGameAccepted`; afterwards a
/// control is referenced on the wire by its 7-bit id alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserControl {
    pub id: u32,
    pub menu_graphic: u32, // 0 = not shown on the menu
    pub menu_direction: u8,
    pub tap_priority: u32,
    pub action_bar_slot: u32,
    pub action_bar_priority: u32,
    pub suicide_key: bool,
    pub menu_special: u8,
    /// Continuous controls execute for as long as the button is held;
    /// non-continuous ones execute once.
    pub continuous: bool,
    pub name: String,
}

impl UserControl {
    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_var_int(self.menu_graphic);
        buf.write_ubyte(self.menu_direction);
        buf.write_var_int(self.tap_priority);
        buf.write_var_int(self.action_bar_slot);
        buf.write_var_int(self.action_bar_priority);
        buf.write_ubyte(self.suicide_key as u8);
        buf.write_ubyte(self.menu_special);
        buf.write_ubyte(self.continuous as u8);
        buf.write_string(&self.name);
    }

    pub fn deserialize(id: u32, buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        let menu_graphic = buf.read_var_int()?;
        let menu_direction = buf.read_ubyte()?;
        if menu_direction > 3 {
            return Err(ProtocolError::OutOfRange("menu direction"));
        }
        Ok(UserControl {
            id,
            menu_graphic,
            menu_direction,
            tap_priority: buf.read_var_int()?,
            action_bar_slot: buf.read_var_int()?,
            action_bar_priority: buf.read_var_int()?,
            suicide_key: buf.read_ubyte()? != 0,
            menu_special: buf.read_ubyte()?,
            continuous: buf.read_ubyte()? != 0,
            name: buf.read_string()?,
        })
    }
}

/// The one-byte control reference of `SendControl`: bit 7 selects the
/// display (split-screen), bits 0-6 the control ordinal (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlByte {
    pub player_slot: u8,
    pub control_num: u8,
}

impl ControlByte {
    pub fn encode(self) -> u8 {
        debug_assert!(self.control_num < 128 && self.player_slot < 2);
        self.control_num | (self.player_slot << 7)
    }

    pub fn decode(b: u8) -> Self {
        ControlByte {
            player_slot: b >> 7,
            control_num: b & 0x7f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_change_lookup_after_unsorted_adds() {
        let mut cc = ColourChange::new();
        cc.add(Colour::rgb(9, 9, 9), Colour::rgb(1, 1, 1));
        cc.add(Colour::rgb(2, 2, 2), Colour::rgb(3, 3, 3));
        assert_eq!(cc.lookup(Colour::rgb(2, 2, 2)), Some(Colour::rgb(3, 3, 3)));
        assert_eq!(cc.lookup(Colour::rgb(9, 9, 9)), Some(Colour::rgb(1, 1, 1)));
        assert_eq!(cc.lookup(Colour::rgb(0, 0, 0)), None);
    }

    #[test]
    fn colour_change_round_trip() {
        let mut cc = ColourChange::new();
        cc.add(Colour::rgb(255, 0, 0), Colour::rgb(0, 0, 255));
        let mut v = Vec::new();
        cc.serialize(&mut OutputByteBuf::new(&mut v));
        let decoded = ColourChange::deserialize(&mut InputByteBuf::new(&v)).unwrap();
        assert_eq!(decoded, cc);
    }

    #[test]
    fn control_byte_round_trip() {
        let cb = ControlByte {
            player_slot: 1,
            control_num: 0x47,
        };
        assert_eq!(ControlByte::decode(cb.encode()), cb);
        assert_eq!(cb.encode(), 0x80 | 0x47);
    }

    #[test]
    fn user_control_round_trip() {
        let ctrl = UserControl {
            id: 5,
            menu_graphic: 12,
            menu_direction: 2,
            tap_priority: 30,
            action_bar_slot: 4,
            action_bar_priority: 10,
            suicide_key: false,
            menu_special: 1,
            continuous: true,
            name: "pick_lock".into(),
        };
        let mut v = Vec::new();
        ctrl.serialize(&mut OutputByteBuf::new(&mut v));
        let decoded = UserControl::deserialize(5, &mut InputByteBuf::new(&v)).unwrap();
        assert_eq!(decoded, ctrl);
    }
}
