//! A small deterministic quest engine.
//!
//! This is not the real Knights rule engine (which is an external
//! collaborator); it is a single-room arena that exercises the whole
//! engine interface (movement, combat, items, eliminations, win/lose,
//! catch-up, the time limit) with fully deterministic behaviour. The
//! server binary runs it so the network stack can be driven end to end,
//! and the test suites lean on its determinism.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use knights_protocol::{Colour, LocalMsg, PlayerId, UserControl};

use crate::engine::{
    EngineError, EngineFactory, EngineParams, EngineStart, GameEngine, PlayerInfo, PlayerState,
};
use crate::views::{
    KnightsCallbacks, MapDirection, MapHeight, MiniMapColour, MotionType, PotionMagic,
};

const ROOM: u32 = 0;
const ROOM_W: u8 = 12;
const ROOM_H: u8 = 10;
const STEP_MS: u32 = 100;
const START_HEALTH: i32 = 3;

// graphic ids in the builtin manifest
const GFX_FLOOR: u32 = 1;
const GFX_WALL: u32 = 2;
const GFX_GEM: u32 = 4;
const ANIM_KNIGHT: u32 = 1;
const SOUND_CLANK: u32 = 1;
const SOUND_SCREAM: u32 = 2;

// control ids in the builtin manifest
const CTRL_ATTACK_BASE: u32 = 1; // 1..=4, one per direction
const CTRL_MOVE_BASE: u32 = 5; // 5..=8, one per direction

/// Gems a knight must collect to win a gem-hunt quest.
const GEMS_TO_WIN: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Quest {
    Duel,
    GemHunt,
    Tutorial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Knight {
    id: PlayerId,
    house_colour_index: u8,
    colour: Colour,
    x: u8,
    y: u8,
    facing: MapDirection,
    health: i32,
    kills: u32,
    deaths: u32,
    frags: i32,
    gems: u32,
    state: PlayerState,
    /// Control applied on the next step, cleared afterwards. The session
    /// re-injects held continuous controls every tick.
    pending_control: Option<u32>,
    speech_bubble: bool,
    approach_based: bool,
    action_bar: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArenaState {
    quest: Quest,
    knights: Vec<Knight>,
    gems: Vec<(u8, u8)>,
    elapsed_ms: u64,
    step_accum_ms: u32,
    time_limit_ms: Option<u64>,
    /// Players whose initial view has been emitted.
    view_sent: Vec<bool>,
    /// Entities removed since the last update, pending `rm_entity`.
    pending_removals: Vec<u16>,
    /// Speech-bubble changes pending emission.
    pending_speech: Vec<(u16, bool)>,
    player_list_dirty: bool,
    game_over: bool,
}

/// The arena engine itself. See the module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaEngine {
    state: ArenaState,
}

impl ArenaEngine {
    fn entity_id(player: usize) -> u16 {
        player as u16 + 1
    }

    fn emit_full_view(&self, player: usize, cb: &mut dyn KnightsCallbacks, force: bool) {
        let st = &self.state;
        {
            let view = cb.dungeon_view(player);
            view.set_current_room(ROOM, ROOM_W, ROOM_H);
            for y in 0..ROOM_H {
                for x in 0..ROOM_W {
                    let wall = x == 0 || y == 0 || x == ROOM_W - 1 || y == ROOM_H - 1;
                    let gfx = if wall { GFX_WALL } else { GFX_FLOOR };
                    view.set_tile(x, y, 0, gfx, None, force);
                }
            }
            for &(x, y) in &st.gems {
                view.set_item(x, y, GFX_GEM, force);
            }
            for (num, kt) in st.knights.iter().enumerate() {
                if matches!(kt.state, PlayerState::Normal) {
                    view.add_entity(
                        Self::entity_id(num),
                        kt.x,
                        kt.y,
                        MapHeight::Walking,
                        kt.facing,
                        ANIM_KNIGHT,
                        0,
                        0,
                        0,
                        false,
                        0,
                        MotionType::NotMoving,
                        0,
                        &kt.id,
                    );
                }
            }
        }
        {
            let map = cb.mini_map(player);
            map.set_size(ROOM_W, ROOM_H);
            for y in 0..ROOM_H {
                for x in 0..ROOM_W {
                    let wall = x == 0 || y == 0 || x == ROOM_W - 1 || y == ROOM_H - 1;
                    let col = if wall {
                        MiniMapColour::Wall
                    } else {
                        MiniMapColour::Floor
                    };
                    map.set_colour(x, y, col);
                }
            }
            for &(x, y) in &st.gems {
                map.map_item_location(x, y, true);
            }
            for (num, kt) in st.knights.iter().enumerate() {
                if matches!(kt.state, PlayerState::Normal) {
                    map.map_knight_location(num as u8, Some((kt.x, kt.y)));
                }
            }
        }
        {
            let kt = &st.knights[player];
            let status = cb.status_display(player);
            status.set_health(kt.health.max(0) as u32);
            status.set_potion_magic(PotionMagic::NoPotion, false);
            status.set_backpack(0, GFX_GEM, 0, kt.gems as u8, GEMS_TO_WIN as u8);
        }
    }

    fn living(&self) -> impl Iterator<Item = (usize, &Knight)> {
        self.state
            .knights
            .iter()
            .enumerate()
            .filter(|(_, k)| matches!(k.state, PlayerState::Normal))
    }

    fn step(&mut self, cb: &mut dyn KnightsCallbacks) {
        if self.state.game_over {
            return;
        }

        let nplayers = self.state.knights.len();
        // Inputs are applied in player-number order; this order is part of
        // the deterministic contract.
        for num in 0..nplayers {
            let Some(control) = self.state.knights[num].pending_control.take() else {
                continue;
            };
            if !matches!(self.state.knights[num].state, PlayerState::Normal) {
                continue;
            }
            if (CTRL_MOVE_BASE..CTRL_MOVE_BASE + 4).contains(&control) {
                if let Some(dir) = MapDirection::from_byte((control - CTRL_MOVE_BASE) as u8) {
                    self.try_move(num, dir, cb);
                }
            } else if (CTRL_ATTACK_BASE..CTRL_ATTACK_BASE + 4).contains(&control) {
                if let Some(dir) = MapDirection::from_byte((control - CTRL_ATTACK_BASE) as u8) {
                    self.attack(num, dir, cb);
                }
            }
        }

        self.check_victory(cb);
    }

    fn offset(x: u8, y: u8, dir: MapDirection) -> (u8, u8) {
        match dir {
            MapDirection::North => (x, y.wrapping_sub(1)),
            MapDirection::East => (x + 1, y),
            MapDirection::South => (x, y + 1),
            MapDirection::West => (x.wrapping_sub(1), y),
        }
    }

    fn try_move(&mut self, num: usize, dir: MapDirection, cb: &mut dyn KnightsCallbacks) {
        let (x, y) = {
            let kt = &self.state.knights[num];
            Self::offset(kt.x, kt.y, dir)
        };
        let blocked = x == 0
            || y == 0
            || x >= ROOM_W - 1
            || y >= ROOM_H - 1
            || self.living().any(|(n, k)| n != num && k.x == x && k.y == y);

        let kt = &mut self.state.knights[num];
        kt.facing = dir;
        for p in 0..self.state.view_sent.len() {
            if self.state.view_sent[p] {
                cb.dungeon_view(p).set_facing(Self::entity_id(num), dir);
            }
        }
        if blocked {
            return;
        }

        let kt = &mut self.state.knights[num];
        kt.x = x;
        kt.y = y;
        let gem = self.state.gems.iter().position(|&g| g == (x, y));
        if let Some(gi) = gem {
            self.state.gems.remove(gi);
            self.state.knights[num].gems += 1;
        }

        for p in 0..self.state.view_sent.len() {
            if !self.state.view_sent[p] {
                continue;
            }
            cb.dungeon_view(p).reposition_entity(Self::entity_id(num), x, y);
            cb.mini_map(p).map_knight_location(num as u8, Some((x, y)));
            if gem.is_some() {
                cb.dungeon_view(p).set_item(x, y, 0, true);
                cb.mini_map(p).map_item_location(x, y, false);
            }
        }
        if gem.is_some() {
            let gems = self.state.knights[num].gems;
            cb.status_display(num)
                .set_backpack(0, GFX_GEM, 0, gems as u8, GEMS_TO_WIN as u8);
        }
    }

    fn attack(&mut self, num: usize, dir: MapDirection, cb: &mut dyn KnightsCallbacks) {
        let (tx, ty) = {
            let kt = &self.state.knights[num];
            Self::offset(kt.x, kt.y, dir)
        };
        cb.play_sound(num, SOUND_CLANK, 1000);
        let victim = self
            .living()
            .find(|(n, k)| *n != num && k.x == tx && k.y == ty)
            .map(|(n, _)| n);
        let Some(victim) = victim else { return };

        let vk = &mut self.state.knights[victim];
        vk.health -= 1;
        let died = vk.health <= 0;
        cb.status_display(victim)
            .set_health(vk.health.max(0) as u32);

        if died {
            self.state.knights[victim].deaths += 1;
            self.state.knights[victim].state = PlayerState::Eliminated;
            self.state.knights[num].kills += 1;
            self.state.knights[num].frags += 1;
            self.state.player_list_dirty = true;
            cb.play_sound(victim, SOUND_SCREAM, 1000);
            cb.status_display(victim).add_skull();
            for p in 0..self.state.view_sent.len() {
                if self.state.view_sent[p] {
                    cb.dungeon_view(p).rm_entity(Self::entity_id(victim));
                    cb.mini_map(p).map_knight_location(victim as u8, None);
                }
            }
            cb.on_elimination(victim);
        }
    }

    fn check_victory(&mut self, cb: &mut dyn KnightsCallbacks) {
        if self.state.game_over {
            return;
        }

        let winner = match self.state.quest {
            Quest::Duel => {
                let mut alive = self.living();
                match (alive.next(), alive.next()) {
                    (Some((num, _)), None) => Some(num),
                    _ => None,
                }
            }
            Quest::GemHunt => self
                .living()
                .find(|(_, k)| k.gems >= GEMS_TO_WIN)
                .map(|(n, _)| n),
            Quest::Tutorial => self.living().find(|(_, k)| k.gems >= 1).map(|(n, _)| n),
        };

        let time_up = self
            .state
            .time_limit_ms
            .is_some_and(|limit| self.state.elapsed_ms >= limit);

        if let Some(winner) = winner {
            self.state.game_over = true;
            self.state.player_list_dirty = true;
            for num in 0..self.state.knights.len() {
                if num == winner {
                    cb.win_game(num);
                } else {
                    cb.lose_game(num);
                }
            }
        } else if time_up {
            self.state.game_over = true;
            self.state.player_list_dirty = true;
            for num in 0..self.state.knights.len() {
                cb.lose_game(num);
            }
        }
    }
}

impl GameEngine for ArenaEngine {
    fn update(&mut self, time_delta_ms: u32, cb: &mut dyn KnightsCallbacks) {
        for num in 0..self.state.view_sent.len() {
            if !self.state.view_sent[num] {
                self.state.view_sent[num] = true;
                self.emit_full_view(num, cb, false);
            }
        }

        for id in std::mem::take(&mut self.state.pending_removals) {
            for p in 0..self.state.view_sent.len() {
                cb.dungeon_view(p).rm_entity(id);
                cb.mini_map(p).map_knight_location(id as u8 - 1, None);
            }
        }

        for (id, show) in std::mem::take(&mut self.state.pending_speech) {
            for p in 0..self.state.view_sent.len() {
                cb.dungeon_view(p).set_speech_bubble(id, show);
            }
        }

        self.state.elapsed_ms += u64::from(time_delta_ms);
        self.state.step_accum_ms += time_delta_ms;
        while self.state.step_accum_ms >= STEP_MS {
            self.state.step_accum_ms -= STEP_MS;
            self.step(cb);
        }
    }

    fn time_to_next_update_ms(&self) -> u32 {
        STEP_MS - self.state.step_accum_ms.min(STEP_MS - 1)
    }

    fn set_control(&mut self, player: usize, control: Option<&UserControl>) {
        if let Some(kt) = self.state.knights.get_mut(player) {
            kt.pending_control = control.map(|c| c.id);
        }
    }

    fn set_approach_based_controls(&mut self, player: usize, flag: bool) {
        if let Some(kt) = self.state.knights.get_mut(player) {
            kt.approach_based = flag;
        }
    }

    fn set_action_bar_controls(&mut self, player: usize, flag: bool) {
        if let Some(kt) = self.state.knights.get_mut(player) {
            kt.action_bar = flag;
        }
    }

    fn set_speech_bubble(&mut self, player: usize, show: bool) {
        if let Some(kt) = self.state.knights.get_mut(player) {
            if kt.speech_bubble != show {
                kt.speech_bubble = show;
                self.state
                    .pending_speech
                    .push((Self::entity_id(player), show));
            }
        }
    }

    fn catch_up(&mut self, player: usize, cb: &mut dyn KnightsCallbacks) {
        cb.prepare_for_catch_up(player);
        self.emit_full_view(player, cb, true);
        if let Some(flag) = self.state.view_sent.get_mut(player) {
            *flag = true;
        }
    }

    fn num_players_remaining(&self) -> usize {
        self.living().count()
    }

    fn change_player_state(&mut self, player: usize, state: PlayerState) {
        let Some(kt) = self.state.knights.get_mut(player) else {
            return;
        };
        let was_normal = matches!(kt.state, PlayerState::Normal);
        kt.state = state;
        self.state.player_list_dirty = true;
        match state {
            PlayerState::Normal => {
                // Reconnecting knight re-enters the room.
                self.state.view_sent[player] = false;
            }
            _ => {
                if was_normal {
                    self.state.pending_removals.push(Self::entity_id(player));
                }
            }
        }
    }

    fn player_list(&self) -> Vec<PlayerInfo> {
        let mut list: Vec<PlayerInfo> = self
            .state
            .knights
            .iter()
            .enumerate()
            .map(|(num, kt)| PlayerInfo {
                id: kt.id.clone(),
                house_colour: kt.colour,
                house_colour_index: kt.house_colour_index,
                player_num: num,
                kills: kt.kills,
                deaths: kt.deaths,
                frags: kt.frags,
                state: kt.state,
            })
            .collect();
        list.sort_by(|a, b| {
            (a.house_colour_index, &a.id).cmp(&(b.house_colour_index, &b.id))
        });
        list
    }

    fn take_player_list_dirty(&mut self) -> bool {
        std::mem::take(&mut self.state.player_list_dirty)
    }

    fn time_remaining_ms(&self) -> Option<u32> {
        self.state
            .time_limit_ms
            .map(|limit| limit.saturating_sub(self.state.elapsed_ms) as u32)
    }

    fn save_state(&self) -> Vec<u8> {
        postcard::to_allocvec(&self.state).expect("arena state is always serializable")
    }
}

/// Factory creating [`ArenaEngine`]s from the menu settings.
pub struct ArenaFactory;

impl EngineFactory for ArenaFactory {
    fn create(&self, params: EngineParams) -> Result<EngineStart, EngineError> {
        let nplayers = params.player_ids.len();
        if nplayers == 0 {
            return Err(EngineError::Startup(LocalMsg::new("no_players")));
        }

        let quest_setting = params
            .menu_settings
            .iter()
            .find(|(k, _)| k == "quest")
            .map_or(0, |(_, v)| *v);
        let quest = match quest_setting {
            1 => Quest::GemHunt,
            2 => Quest::Tutorial,
            _ => Quest::Duel,
        };
        let time_limit_ms = params
            .menu_settings
            .iter()
            .find(|(k, _)| k == "time_limit")
            .and_then(|(_, mins)| (*mins > 0).then(|| *mins as u64 * 60_000));

        // Start positions go clockwise round the walls; gem positions come
        // from the seeded RNG so replicas agree.
        let corners = [
            (1u8, 1u8),
            (ROOM_W - 2, ROOM_H - 2),
            (ROOM_W - 2, 1),
            (1, ROOM_H - 2),
            (ROOM_W / 2, 1),
            (ROOM_W / 2, ROOM_H - 2),
        ];
        let mut rng = SmallRng::seed_from_u64(params.rng_seed);
        let mut gems = Vec::new();
        while gems.len() < GEMS_TO_WIN as usize {
            let pos = (
                rng.random_range(1..ROOM_W - 1),
                rng.random_range(1..ROOM_H - 1),
            );
            if !gems.contains(&pos) && !corners[..nplayers.min(corners.len())].contains(&pos) {
                gems.push(pos);
            }
        }

        let house_colours = crate::config::Manifest::builtin().house_colours;
        let knights = params
            .player_ids
            .iter()
            .enumerate()
            .map(|(num, id)| {
                let colour_index = params.house_colours.get(num).copied().unwrap_or(0);
                Knight {
                    id: id.clone(),
                    house_colour_index: colour_index,
                    colour: house_colours
                        .get(colour_index as usize)
                        .copied()
                        .unwrap_or(Colour::rgb(255, 255, 255)),
                    x: corners[num % corners.len()].0,
                    y: corners[num % corners.len()].1,
                    facing: MapDirection::South,
                    health: START_HEALTH,
                    kills: 0,
                    deaths: 0,
                    frags: 0,
                    gems: 0,
                    state: PlayerState::Normal,
                    pending_control: None,
                    speech_bubble: false,
                    approach_based: true,
                    action_bar: false,
                }
            })
            .collect();

        Ok(EngineStart {
            engine: Box::new(ArenaEngine {
                state: ArenaState {
                    quest,
                    knights,
                    gems,
                    elapsed_ms: 0,
                    step_accum_ms: 0,
                    time_limit_ms,
                    view_sent: vec![false; nplayers],
                    pending_removals: Vec::new(),
                    pending_speech: Vec::new(),
                    player_list_dirty: false,
                    game_over: false,
                },
            }),
            deathmatch: false,
            messages: vec![LocalMsg::new("quest_started")],
        })
    }

    fn restore(&self, state: &[u8]) -> Result<Box<dyn GameEngine>, EngineError> {
        let state: ArenaState =
            postcard::from_bytes(state).map_err(|_| EngineError::BadSaveState)?;
        Ok(Box::new(ArenaEngine { state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_engine(nplayers: usize, seed: u64) -> Box<dyn GameEngine> {
        let params = EngineParams {
            house_colours: (0..nplayers as u8).collect(),
            player_ids: (0..nplayers)
                .map(|i| PlayerId::new(format!("kt{i}")))
                .collect(),
            menu_settings: vec![("quest".into(), 0), ("time_limit".into(), 0)],
            rng_seed: seed,
        };
        ArenaFactory.create(params).unwrap().engine
    }

    #[test]
    fn same_seed_same_save_state() {
        let a = make_engine(2, 42);
        let b = make_engine(2, 42);
        assert_eq!(a.save_state(), b.save_state());
        let c = make_engine(2, 43);
        assert_ne!(a.save_state(), c.save_state());
    }

    #[test]
    fn save_restore_round_trip() {
        let engine = make_engine(3, 7);
        let saved = engine.save_state();
        let restored = ArenaFactory.restore(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
    }

    #[test]
    fn eliminations_dirty_the_player_list() {
        let mut engine = make_engine(2, 1);
        assert!(!engine.take_player_list_dirty());
        engine.change_player_state(1, PlayerState::Disconnected);
        assert!(engine.take_player_list_dirty());
        assert!(!engine.take_player_list_dirty());
        assert_eq!(engine.num_players_remaining(), 1);
    }
}
