//! The per-game view sink: one set of encoders per player plus the
//! observer fan-out.
//!
//! The engine writes into this during each update; afterwards the session
//! worker drains the accumulated bytes into the right connection buffers.
//! Output order per observer is stable: public stream, then private
//! stream, then mini-map, then dungeon view.

use serde::{Deserialize, Serialize};

use knights_engine::{
    DungeonView, KnightsCallbacks, MapDirection, MapHeight, MiniMap, MiniMapColour, MotionType,
    PotionMagic, StatusDisplay, TutorialWindow,
};
use knights_protocol::{
    ext_msg, server_msg, write_local_msg, ColourChange, LocalMsg, OutputByteBuf, PlayerId,
};

use crate::dungeon::DungeonViewState;
use crate::minimap::MiniMapState;
use crate::status;

/// Error announcements per game are capped; a runaway quest script would
/// otherwise flood every client.
const MAX_ERROR_MSGS: u32 = 50;

/// Dungeon seen-cache keys combine observer number and player number.
fn observer_key(observer_num: u32, player: usize) -> u32 {
    observer_num * 1000 + player as u32
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlayerView {
    /// Public stream: everything an observer of this player also sees.
    pub_data: Vec<u8>,
    /// Private stream: available controls, menu highlight, private
    /// messages.
    prv_data: Vec<u8>,
    dungeon: DungeonViewState,
    minimap: MiniMapState,
    prev_menu_highlight: Option<u8>,
    loser: bool,
}

impl DungeonView for PlayerView {
    fn set_current_room(&mut self, room: u32, width: u8, height: u8) {
        self.dungeon
            .set_current_room(&mut self.pub_data, room, width, height);
    }

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
    ) {
        self.dungeon.add_entity(
            &mut self.pub_data,
            id,
            x,
            y,
            height,
            facing,
            anim,
            overlay,
            anim_frame,
            anim_tzero_diff,
            anim_invuln,
            cur_ofs,
            motion,
            motion_time_remaining,
            name,
        );
    }

    fn rm_entity(&mut self, id: u16) {
        self.dungeon.rm_entity(&mut self.pub_data, id);
    }

    fn reposition_entity(&mut self, id: u16, x: u8, y: u8) {
        self.dungeon.reposition_entity(&mut self.pub_data, id, x, y);
    }

    fn move_entity(&mut self, id: u16, motion: MotionType, motion_duration: u16, missile: bool) {
        self.dungeon
            .move_entity(&mut self.pub_data, id, motion, motion_duration, missile);
    }

    fn flip_entity_motion(&mut self, id: u16, initial_delay: u16, motion_duration: u16) {
        self.dungeon
            .flip_entity_motion(&mut self.pub_data, id, initial_delay, motion_duration);
    }

    fn set_anim_data(
        &mut self,
        id: u16,
        anim: u32,
        overlay: u32,
        anim_frame: u8,
        anim_tzero_diff: i16,
        anim_invuln: bool,
        currently_moving: bool,
    ) {
        self.dungeon.set_anim_data(
            &mut self.pub_data,
            id,
            anim,
            overlay,
            anim_frame,
            anim_tzero_diff,
            anim_invuln,
            currently_moving,
        );
    }

    fn set_facing(&mut self, id: u16, facing: MapDirection) {
        self.dungeon.set_facing(&mut self.pub_data, id, facing);
    }

    fn set_speech_bubble(&mut self, id: u16, show: bool) {
        self.dungeon.set_speech_bubble(&mut self.pub_data, id, show);
    }

    fn clear_tiles(&mut self, x: u8, y: u8, force: bool) {
        self.dungeon.clear_tiles(x, y, force);
    }

    fn set_tile(&mut self, x: u8, y: u8, depth: i8, gfx: u32, cc: Option<&ColourChange>, force: bool) {
        self.dungeon.set_tile(x, y, depth, gfx, cc, force);
    }

    fn set_item(&mut self, x: u8, y: u8, gfx: u32, force: bool) {
        self.dungeon.set_item(x, y, gfx, force);
    }

    fn place_icon(&mut self, x: u8, y: u8, gfx: u32, duration_ms: u16) {
        self.dungeon
            .place_icon(&mut self.pub_data, x, y, gfx, duration_ms);
    }

    fn flash_message(&mut self, msg: &LocalMsg, ntimes: u8) {
        self.dungeon.flash_message(&mut self.pub_data, msg, ntimes);
    }

    fn cancel_continuous_messages(&mut self) {
        self.dungeon.cancel_continuous_messages(&mut self.pub_data);
    }

    fn add_continuous_message(&mut self, msg: &LocalMsg) {
        self.dungeon.add_continuous_message(&mut self.pub_data, msg);
    }
}

impl MiniMap for PlayerView {
    fn set_size(&mut self, width: u8, height: u8) {
        self.minimap.set_size(&mut self.pub_data, width, height);
    }

    fn set_colour(&mut self, x: u8, y: u8, col: MiniMapColour) {
        self.minimap.set_colour(x, y, col);
    }

    fn wipe_map(&mut self) {
        self.minimap.wipe_map(&mut self.pub_data);
    }

    fn map_knight_location(&mut self, n: u8, pos: Option<(u8, u8)>) {
        self.minimap.map_knight_location(&mut self.pub_data, n, pos);
    }

    fn map_item_location(&mut self, x: u8, y: u8, on: bool) {
        self.minimap.map_item_location(&mut self.pub_data, x, y, on);
    }
}

impl StatusDisplay for PlayerView {
    fn set_backpack(&mut self, slot: u8, gfx: u32, overdraw_gfx: u32, no_carried: u8, no_max: u8) {
        status::set_backpack(&mut self.pub_data, slot, gfx, overdraw_gfx, no_carried, no_max);
    }

    fn add_skull(&mut self) {
        status::add_skull(&mut self.pub_data);
    }

    fn set_health(&mut self, health: u32) {
        status::set_health(&mut self.pub_data, health);
    }

    fn set_potion_magic(&mut self, potion_magic: PotionMagic, poison_immunity: bool) {
        status::set_potion_magic(&mut self.pub_data, potion_magic, poison_immunity);
    }

    fn set_quest_hints(&mut self, hints: &[LocalMsg]) {
        status::set_quest_hints(&mut self.pub_data, hints);
    }
}

/// Grouped view sink for one running game.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewSink {
    players: Vec<PlayerView>,
    game_over: bool,
    /// Player number of the winner; `None` when everyone lost.
    winner_num: Option<usize>,
    next_observer_num: u32,
    to_obs_mode: Vec<usize>,
    num_err_msgs: u32,
}

impl ViewSink {
    pub fn new(nplayers: usize) -> Self {
        ViewSink {
            players: (0..nplayers).map(|_| PlayerView::default()).collect(),
            game_over: false,
            winner_num: None,
            next_observer_num: 1,
            to_obs_mode: Vec::new(),
            num_err_msgs: 0,
        }
    }

    pub fn num_players(&self) -> usize {
        self.players.len()
    }

    /// Appends one player's queued commands (including their private
    /// stream) to `out`.
    pub fn append_player_cmds(&mut self, player: usize, out: &mut Vec<u8>) {
        self.do_append(player, out, 0, true);
    }

    /// Appends the observer variant: every player's public streams, each
    /// prefixed by `SwitchPlayer` (elided when there is no output).
    pub fn append_observer_cmds(&mut self, observer_num: u32, out: &mut Vec<u8>) {
        for player in 0..self.players.len() {
            out.push(server_msg::SWITCH_PLAYER);
            out.push(player as u8);
            let prev_len = out.len();
            self.do_append(player, out, observer_num, false);
            if out.len() == prev_len {
                out.pop();
                out.pop();
            }
        }
    }

    fn do_append(&mut self, player: usize, out: &mut Vec<u8>, observer_num: u32, private: bool) {
        let view = &mut self.players[player];
        out.extend_from_slice(&view.pub_data);
        if private {
            out.extend_from_slice(&view.prv_data);
        }
        view.minimap.append_cmds(out);
        view.dungeon.append_cmds(observer_key(observer_num, player), out);
    }

    /// Clears all queued commands; called once per update after every
    /// connection has been served.
    pub fn clear_cmds(&mut self) {
        for view in &mut self.players {
            view.pub_data.clear();
            view.prv_data.clear();
            view.minimap.clear_cmds();
            view.dungeon.clear_cmds();
        }
    }

    pub fn alloc_observer_num(&mut self) -> u32 {
        let num = self.next_observer_num;
        self.next_observer_num += 1;
        num
    }

    pub fn rm_observer_num(&mut self, observer_num: u32) {
        for (player, view) in self.players.iter_mut().enumerate() {
            view.dungeon
                .rm_observer_num(observer_key(observer_num, player));
        }
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over
    }

    pub fn winner_num(&self) -> Option<usize> {
        self.winner_num
    }

    pub fn is_loser(&self, player: usize) -> bool {
        self.players.get(player).is_some_and(|p| p.loser)
    }

    /// Players eliminated since the last call; the session puts them into
    /// observer mode.
    pub fn take_players_to_put_into_obs_mode(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.to_obs_mode)
    }
}

impl KnightsCallbacks for ViewSink {
    fn dungeon_view(&mut self, player: usize) -> &mut dyn DungeonView {
        &mut self.players[player]
    }

    fn mini_map(&mut self, player: usize) -> &mut dyn MiniMap {
        &mut self.players[player]
    }

    fn status_display(&mut self, player: usize) -> &mut dyn StatusDisplay {
        &mut self.players[player]
    }

    fn play_sound(&mut self, player: usize, sound: u32, frequency: u32) {
        let mut buf = OutputByteBuf::new(&mut self.players[player].pub_data);
        buf.write_ubyte(server_msg::PLAY_SOUND);
        buf.write_var_int(sound);
        buf.write_var_int(frequency);
    }

    fn win_game(&mut self, player: usize) {
        self.players[player].pub_data.push(server_msg::WIN_GAME);
        self.game_over = true;
        self.winner_num = Some(player);
    }

    fn lose_game(&mut self, player: usize) {
        self.players[player].pub_data.push(server_msg::LOSE_GAME);
        self.players[player].loser = true;
        if self.players.iter().all(|p| p.loser) {
            self.game_over = true;
            self.winner_num = None;
        }
    }

    fn set_available_controls(&mut self, player: usize, controls: &[(u8, bool)]) {
        let mut buf = OutputByteBuf::new(&mut self.players[player].prv_data);
        buf.write_ubyte(server_msg::SET_AVAILABLE_CONTROLS);
        buf.write_ubyte(controls.len() as u8);
        for &(id, primary) in controls {
            debug_assert!(id > 0 && id < 128);
            buf.write_ubyte(if primary { id + 128 } else { id });
        }
    }

    fn set_menu_highlight(&mut self, player: usize, control: u8) {
        let view = &mut self.players[player];
        if view.prev_menu_highlight == Some(control) {
            return;
        }
        view.prev_menu_highlight = Some(control);
        let mut buf = OutputByteBuf::new(&mut view.prv_data);
        buf.write_ubyte(server_msg::SET_MENU_HIGHLIGHT);
        buf.write_ubyte(control);
    }

    fn flash_screen(&mut self, player: usize, delay_ms: u32) {
        let mut buf = OutputByteBuf::new(&mut self.players[player].pub_data);
        buf.write_ubyte(server_msg::FLASH_SCREEN);
        buf.write_var_int(delay_ms);
    }

    fn game_msg(&mut self, player: Option<usize>, msg: &LocalMsg, is_err: bool) {
        if is_err {
            self.num_err_msgs += 1;
            if self.num_err_msgs > MAX_ERROR_MSGS {
                return;
            }
        }

        for p in 0..self.players.len() {
            let send = match player {
                Some(target) => p == target,
                None => true,
            };
            if !send {
                continue;
            }
            // On a broadcast the first copy goes to the public stream and
            // the rest to private streams, so observers see it only once.
            let view = &mut self.players[p];
            let broadcast_dup = player.is_none() && p > 0;
            let data = if broadcast_dup {
                &mut view.prv_data
            } else {
                &mut view.pub_data
            };
            let mut buf = OutputByteBuf::new(data);
            if is_err {
                buf.write_ubyte(server_msg::EXTENDED_MESSAGE);
                buf.write_var_int(ext_msg::NEXT_ANNOUNCEMENT_IS_ERROR as u32);
                buf.write_ushort(0);
            }
            buf.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
            write_local_msg(&mut buf, msg);
        }

        if is_err && self.num_err_msgs == MAX_ERROR_MSGS {
            self.game_msg(None, &LocalMsg::new("too_many_errors"), false);
        }
    }

    fn pop_up_window(&mut self, windows: &[TutorialWindow]) {
        // Tutorials only exist in one-player games.
        let Some(view) = self.players.first_mut() else {
            return;
        };
        let mut buf = OutputByteBuf::new(&mut view.pub_data);
        buf.write_ubyte(server_msg::POP_UP_WINDOW);
        buf.write_var_int(windows.len() as u32);
        for w in windows {
            write_local_msg(&mut buf, &w.title);
            write_local_msg(&mut buf, &w.msg);
            buf.write_var_int(w.popup as u32);
            buf.write_var_int(w.gfx.len() as u32);
            for (i, gfx) in w.gfx.iter().enumerate() {
                buf.write_var_int(*gfx);
                w.cc.get(i).cloned().unwrap_or_default().serialize(&mut buf);
            }
        }
    }

    fn on_elimination(&mut self, player: usize) {
        self.to_obs_mode.push(player);
    }

    fn disable_view(&mut self, player: usize) {
        let mut buf = OutputByteBuf::new(&mut self.players[player].pub_data);
        buf.write_ubyte(server_msg::EXTENDED_MESSAGE);
        buf.write_var_int(ext_msg::DISABLE_VIEW as u32);
        buf.write_ushort(0);
    }

    fn prepare_for_catch_up(&mut self, player: usize) {
        let key = observer_key(0, player);
        let view = &mut self.players[player];
        view.dungeon.rm_observer_num(key);
        view.minimap.prepare_for_catch_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_player_is_elided_when_no_output() {
        let mut sink = ViewSink::new(2);
        // only player 1 produced anything
        sink.play_sound(1, 3, 1000);

        let mut out = Vec::new();
        sink.append_observer_cmds(5, &mut out);

        // exactly one SWITCH_PLAYER header, for player 1
        assert_eq!(out[0], server_msg::SWITCH_PLAYER);
        assert_eq!(out[1], 1);
        assert_eq!(
            out.iter()
                .filter(|&&b| b == server_msg::SWITCH_PLAYER)
                .count(),
            1
        );
    }

    #[test]
    fn all_losers_means_game_over_without_winner() {
        let mut sink = ViewSink::new(2);
        sink.lose_game(0);
        assert!(!sink.is_game_over());
        sink.lose_game(1);
        assert!(sink.is_game_over());
        assert_eq!(sink.winner_num(), None);
    }

    #[test]
    fn win_records_winner() {
        let mut sink = ViewSink::new(3);
        sink.win_game(2);
        assert!(sink.is_game_over());
        assert_eq!(sink.winner_num(), Some(2));
        assert!(!sink.is_loser(2));
    }

    #[test]
    fn error_messages_are_capped() {
        let mut sink = ViewSink::new(1);
        for _ in 0..(MAX_ERROR_MSGS + 10) {
            sink.game_msg(Some(0), &LocalMsg::new("script_error"), true);
        }
        sink.clear_cmds();
        sink.game_msg(Some(0), &LocalMsg::new("script_error"), true);
        let mut out = Vec::new();
        sink.append_player_cmds(0, &mut out);
        assert!(out.is_empty(), "capped errors must produce no output");
    }

    #[test]
    fn menu_highlight_is_memoised() {
        let mut sink = ViewSink::new(1);
        sink.set_menu_highlight(0, 7);
        sink.set_menu_highlight(0, 7);
        let mut out = Vec::new();
        sink.append_player_cmds(0, &mut out);
        assert_eq!(
            out.iter()
                .filter(|&&b| b == server_msg::SET_MENU_HIGHLIGHT)
                .count(),
            1
        );
    }
}
