//! Dungeon-view encoder with per-square diff suppression.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use knights_engine::{MapDirection, MapHeight, MotionType};
use knights_protocol::{server_msg, ColourChange, OutputByteBuf, PlayerId};

fn write_room_coord(buf: &mut OutputByteBuf<'_>, x: u8, y: u8) {
    buf.write_nibbles(x + 1, y + 1);
}

/// Tile depth goes on the wire as `depth + 64` in 7 bits; the top bit
/// flags a colour change following.
fn write_tile_info(buf: &mut OutputByteBuf<'_>, depth: i8, has_cc: bool) {
    let d = (depth as i16 + 64).clamp(0, 127) as u8;
    buf.write_ubyte(if has_cc { 128 + d } else { d });
}

/// Whether an observer has had a square's contents sent before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquareSeen {
    #[default]
    Unseen,
    Seen,
    /// Downgraded from `Seen`: the tiles are known but the item must be
    /// re-sent on the next visit.
    ItemCleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomSeen {
    width: u8,
    height: u8,
    square_seen: Vec<SquareSeen>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Cmd {
    ClearTiles {
        x: u8,
        y: u8,
        force: bool,
    },
    SetTile {
        x: u8,
        y: u8,
        depth: i8,
        gfx: u32,
        cc: Option<ColourChange>,
        force: bool,
    },
    SetItem {
        x: u8,
        y: u8,
        gfx: u32,
        force: bool,
    },
}

impl Cmd {
    fn coords(&self) -> (u8, u8) {
        match *self {
            Cmd::ClearTiles { x, y, .. } | Cmd::SetTile { x, y, .. } | Cmd::SetItem { x, y, .. } => {
                (x, y)
            }
        }
    }

    fn force(&self) -> bool {
        match *self {
            Cmd::ClearTiles { force, .. }
            | Cmd::SetTile { force, .. }
            | Cmd::SetItem { force, .. } => force,
        }
    }
}

/// Diff cache for one player's dungeon view.
///
/// Entity commands are written straight to the output stream; tile and
/// item commands are buffered per update and flushed once per observer,
/// consulting the (observer, room) seen-cache to drop updates the
/// observer already has.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DungeonViewState {
    current_room: Option<u32>,
    room_width: u8,
    room_height: u8,
    /// Keyed by (observer number, room number).
    cached_rooms: BTreeMap<(u32, u32), RoomSeen>,
    cmds: Vec<Cmd>,
}

impl DungeonViewState {
    // -- direct commands ----------------------------------------------------

    pub fn set_current_room(&mut self, out: &mut Vec<u8>, room: u32, width: u8, height: u8) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_CURRENT_ROOM);
        buf.write_var_int(room);
        write_room_coord(&mut buf, width, height);

        // Any still-buffered forced commands for the old room would be
        // lost here. Downgrade their squares so the items get re-sent on
        // the next visit (fixes the scroll-edge bug).
        if let Some(old_room) = self.current_room {
            if self.cmds.iter().any(Cmd::force) {
                let width = self.room_width as usize;
                for ((_, room), seen) in self.cached_rooms.iter_mut() {
                    if *room != old_room {
                        continue;
                    }
                    for cmd in &self.cmds {
                        if cmd.force() {
                            let (x, y) = cmd.coords();
                            let idx = y as usize * width + x as usize;
                            if let Some(sq) = seen.square_seen.get_mut(idx) {
                                *sq = SquareSeen::ItemCleared;
                            }
                        }
                    }
                }
            }
        }
        self.cmds.clear();

        self.current_room = Some(room);
        self.room_width = width;
        self.room_height = height;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_entity(
        &mut self,
        out: &mut Vec<u8>,
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
    ) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::ADD_ENTITY);
        buf.write_var_int(id as u32);
        write_room_coord(&mut buf, x, y);
        buf.write_nibbles(height as u8, facing as u8);
        buf.write_var_int(anim);
        buf.write_var_int(overlay);
        buf.write_nibbles(anim_frame, ((motion as u8) << 1) | anim_invuln as u8);
        if anim_frame != 0 {
            buf.write_short(anim_tzero_diff);
        }
        buf.write_ushort(cur_ofs);
        if motion != MotionType::NotMoving {
            buf.write_ushort(motion_time_remaining);
        }
        buf.write_string(name.as_str());
    }

    pub fn rm_entity(&mut self, out: &mut Vec<u8>, id: u16) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::RM_ENTITY);
        buf.write_var_int(id as u32);
    }

    pub fn reposition_entity(&mut self, out: &mut Vec<u8>, id: u16, x: u8, y: u8) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::REPOSITION_ENTITY);
        buf.write_var_int(id as u32);
        write_room_coord(&mut buf, x, y);
    }

    pub fn move_entity(
        &mut self,
        out: &mut Vec<u8>,
        id: u16,
        motion: MotionType,
        motion_duration: u16,
        missile_mode: bool,
    ) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::MOVE_ENTITY);
        buf.write_var_int(id as u32);
        buf.write_nibbles(motion as u8, missile_mode as u8);
        buf.write_ushort(motion_duration);
    }

    pub fn flip_entity_motion(
        &mut self,
        out: &mut Vec<u8>,
        id: u16,
        initial_delay: u16,
        motion_duration: u16,
    ) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::FLIP_ENTITY_MOTION);
        buf.write_var_int(id as u32);
        buf.write_ushort(initial_delay);
        buf.write_ushort(motion_duration);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_anim_data(
        &mut self,
        out: &mut Vec<u8>,
        id: u16,
        anim: u32,
        overlay: u32,
        anim_frame: u8,
        anim_tzero_diff: i16,
        anim_invuln: bool,
        currently_moving: bool,
    ) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_ANIM_DATA);
        buf.write_var_int(id as u32);
        buf.write_var_int(anim);
        buf.write_var_int(overlay);
        buf.write_nibbles(anim_frame, (anim_invuln as u8) * 2 + currently_moving as u8);
        buf.write_short(anim_tzero_diff);
    }

    pub fn set_facing(&mut self, out: &mut Vec<u8>, id: u16, facing: MapDirection) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_FACING);
        buf.write_var_int(id as u32);
        buf.write_ubyte(facing as u8);
    }

    pub fn set_speech_bubble(&mut self, out: &mut Vec<u8>, id: u16, show: bool) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_SPEECH_BUBBLE);
        buf.write_var_int(id as u32);
        buf.write_ubyte(show as u8);
    }

    pub fn place_icon(&mut self, out: &mut Vec<u8>, x: u8, y: u8, gfx: u32, duration_ms: u16) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::PLACE_ICON);
        write_room_coord(&mut buf, x, y);
        buf.write_var_int(gfx);
        buf.write_ushort(duration_ms);
    }

    pub fn flash_message(&mut self, out: &mut Vec<u8>, msg: &knights_protocol::LocalMsg, ntimes: u8) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::FLASH_MESSAGE);
        knights_protocol::write_local_msg(&mut buf, msg);
        buf.write_ubyte(ntimes);
    }

    pub fn cancel_continuous_messages(&mut self, out: &mut Vec<u8>) {
        out.push(server_msg::CANCEL_CONTINUOUS_MESSAGES);
    }

    pub fn add_continuous_message(&mut self, out: &mut Vec<u8>, msg: &knights_protocol::LocalMsg) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::ADD_CONTINUOUS_MESSAGE);
        knights_protocol::write_local_msg(&mut buf, msg);
    }

    // -- buffered commands --------------------------------------------------

    pub fn clear_tiles(&mut self, x: u8, y: u8, force: bool) {
        self.cmds.push(Cmd::ClearTiles { x, y, force });
    }

    pub fn set_tile(
        &mut self,
        x: u8,
        y: u8,
        depth: i8,
        gfx: u32,
        cc: Option<&ColourChange>,
        force: bool,
    ) {
        self.cmds.push(Cmd::SetTile {
            x,
            y,
            depth,
            gfx,
            cc: cc.cloned(),
            force,
        });
    }

    pub fn set_item(&mut self, x: u8, y: u8, gfx: u32, force: bool) {
        self.cmds.push(Cmd::SetItem { x, y, gfx, force });
    }

    /// Appends the buffered tile/item commands for one observer,
    /// suppressing updates for squares that observer has already seen
    /// (unless forced), and marking squares seen afterwards.
    pub fn append_cmds(&mut self, observer_num: u32, out: &mut Vec<u8>) {
        let Some(room) = self.current_room else {
            return;
        };
        let width = self.room_width;
        let height = self.room_height;
        let seen = self
            .cached_rooms
            .entry((observer_num, room))
            .or_insert_with(|| RoomSeen {
                width,
                height,
                square_seen: vec![SquareSeen::Unseen; width as usize * height as usize],
            });

        let mut buf = OutputByteBuf::new(out);
        for (i, cmd) in self.cmds.iter().enumerate() {
            let (x, y) = cmd.coords();
            let idx = y as usize * width as usize + x as usize;
            let state = seen.square_seen.get(idx).copied().unwrap_or_default();
            let must_send = cmd.force() || state != SquareSeen::Seen;

            if must_send {
                match cmd {
                    Cmd::SetTile {
                        x, y, depth, gfx, cc, ..
                    } => {
                        buf.write_ubyte(server_msg::SET_TILE);
                        write_room_coord(&mut buf, *x, *y);
                        write_tile_info(&mut buf, *depth, cc.is_some());
                        buf.write_var_int(*gfx);
                        if let Some(cc) = cc {
                            cc.serialize(&mut buf);
                        }
                    }
                    Cmd::ClearTiles { x, y, .. } => {
                        buf.write_ubyte(server_msg::CLEAR_TILES);
                        write_room_coord(&mut buf, *x, *y);
                    }
                    Cmd::SetItem { x, y, gfx, .. } => {
                        // Unseen squares default to "no item" on the
                        // client, so a null item there is pure bandwidth.
                        let they_already_know = state == SquareSeen::Unseen && *gfx == 0;
                        if !they_already_know {
                            buf.write_ubyte(server_msg::SET_ITEM);
                            write_room_coord(&mut buf, *x, *y);
                            buf.write_var_int(*gfx);
                        }
                    }
                }
            }

            if state != SquareSeen::Seen {
                // Send all commands in a batch for this square before
                // marking it seen: hold off while the next command is on
                // the same square.
                let next_same = self
                    .cmds
                    .get(i + 1)
                    .is_some_and(|next| next.coords() == (x, y));
                if !next_same {
                    if let Some(sq) = seen.square_seen.get_mut(idx) {
                        *sq = SquareSeen::Seen;
                    }
                }
            }
        }
    }

    /// Drops the buffered commands after all observers have been served.
    pub fn clear_cmds(&mut self) {
        self.cmds.clear();
    }

    /// Forgets the seen-caches of a departed observer.
    pub fn rm_observer_num(&mut self, observer_num: u32) {
        self.cached_rooms
            .retain(|(obs, _), _| *obs != observer_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush(view: &mut DungeonViewState, observer: u32) -> Vec<u8> {
        let mut out = Vec::new();
        view.append_cmds(observer, &mut out);
        view.clear_cmds();
        out
    }

    fn enter_room(view: &mut DungeonViewState) {
        let mut out = Vec::new();
        view.set_current_room(&mut out, 5, 8, 8);
    }

    #[test]
    fn repeated_unforced_set_tile_is_suppressed() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view);

        view.set_tile(3, 4, 0, 17, None, false);
        let first = flush(&mut view, 0);
        assert!(!first.is_empty());

        view.set_tile(3, 4, 0, 17, None, false);
        let second = flush(&mut view, 0);
        assert!(second.is_empty());
    }

    #[test]
    fn forced_set_tile_is_always_sent() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view);

        view.set_tile(3, 4, 0, 17, None, false);
        flush(&mut view, 0);

        view.set_tile(3, 4, 0, 17, None, true);
        assert!(!flush(&mut view, 0).is_empty());
    }

    #[test]
    fn null_item_on_unseen_square_is_omitted() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view);

        view.set_item(2, 2, 0, false);
        assert!(flush(&mut view, 0).is_empty());

        // but a real item on an unseen square goes out
        view.set_item(2, 2, 9, false);
        assert!(!flush(&mut view, 0).is_empty());
    }

    #[test]
    fn seen_cache_is_per_observer() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view);

        view.set_tile(1, 1, 0, 3, None, false);
        view.append_cmds(7, &mut Vec::new());
        view.clear_cmds();

        // observer 8 has not seen the square yet
        view.set_tile(1, 1, 0, 3, None, false);
        assert!(!flush(&mut view, 8).is_empty());
    }

    #[test]
    fn batch_for_one_square_is_fully_sent_before_marking_seen() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view);

        view.set_tile(3, 3, 0, 1, None, false);
        view.set_tile(3, 3, 1, 2, None, false);
        let out = flush(&mut view, 0);
        // both commands present: two SET_TILE codes
        let count = out
            .iter()
            .filter(|&&b| b == server_msg::SET_TILE)
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn room_switch_with_forced_cmds_downgrades_seen_squares() {
        let mut view = DungeonViewState::default();
        enter_room(&mut view); // room 5

        view.set_tile(4, 4, 0, 1, None, false);
        view.set_item(4, 4, 9, false);
        flush(&mut view, 0);

        // leave a forced item command un-flushed, then switch rooms
        view.set_item(4, 4, 0, true);
        let mut out = Vec::new();
        view.set_current_room(&mut out, 6, 8, 8);

        // back to room 5: the square must be re-sendable again
        view.set_current_room(&mut out, 5, 8, 8);
        view.set_item(4, 4, 9, false);
        assert!(!flush(&mut view, 0).is_empty());
    }
}
