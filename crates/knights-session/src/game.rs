//! `KnightsGame`: one multi-player game on the server.
//!
//! All mutable state lives in `GameCore` behind a single mutex; public
//! operations lock it, and in threaded mode the simulation worker holds it
//! for the duration of each update. Callers must not hold any other lock
//! when calling in. A condition variable gives the worker a prompt wake-up
//! when new input arrives.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use knights_engine::{GameConfig, GameEngine, MenuChoiceValue, MenuListener, MenuState};
use knights_protocol::{
    server_msg, write_local_msg, ChatKind, GameStatus, LocalMsg, LocalParam, OutputByteBuf,
    PlayerId,
};
use knights_view::ViewSink;

use crate::clock::Clock;
use crate::connection::{GameConnection, CONTROL_QUEUE_MAX};
use crate::error::SessionError;
use crate::worker::{self, WorkerState};

/// Recent (player id, house colour) pairs are remembered in a circular
/// buffer so a reconnecting player keeps their colour.
const HOUSE_COLOUR_MEMORY: usize = 30;

/// How a session's simulation worker is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Dedicated OS thread per running game (native servers).
    Threaded,
    /// No threads; the host calls [`KnightsGame::pump`] (replicated VM).
    Cooperative,
}

pub(crate) struct GameCore {
    pub config: GameConfig,
    pub clock: Arc<dyn Clock>,
    pub allow_split_screen: bool,
    pub game_name: String,

    pub connections: Vec<GameConnection>,
    /// Joins arriving while a game runs, admitted by the worker's
    /// pre-update step.
    pub incoming_connections: Vec<GameConnection>,

    pub deathmatch_mode: bool,
    pub game_over: bool,
    pub pause_mode: bool,

    /// Present while a game is running.
    pub worker: Option<WorkerState>,
    pub engine: Option<Box<dyn GameEngine>>,
    pub sink: Option<ViewSink>,

    pub delete_observer_nums: Vec<u32>,
    pub pending_disconnections: Vec<usize>,
    pub all_player_ids: Vec<PlayerId>,

    previous_house_colours: Vec<(PlayerId, u8)>,
    previous_house_colours_next: usize,

    pub wake_up_flag: bool,
    /// True while a worker thread is alive and will keep driving any
    /// current (or newly started) worker state. Cleared by the thread
    /// itself, under the lock, as it commits to exiting.
    pub worker_thread_active: bool,
    /// Set when the engine panicked; the owning server tears the whole
    /// session down when it sees this.
    pub fatal_error: Option<String>,

    next_conn_id: u64,
    rng_seed: u64,
    rng_counter: u64,
}

impl GameCore {
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn conn_index(&self, conn_id: u64) -> Option<usize> {
        self.connections.iter().position(|c| c.conn_id == conn_id)
    }

    pub fn count_players(&self) -> u32 {
        self.connections
            .iter()
            .filter(|c| !c.obs_flag)
            .map(|c| c.num_player_slots() as u32)
            .sum()
    }

    pub fn count_observers(&self) -> u32 {
        self.connections.iter().filter(|c| c.obs_flag).count() as u32
    }

    pub fn count_teams(&self) -> u32 {
        let mut teams = std::collections::BTreeSet::new();
        for conn in self.connections.iter().filter(|c| !c.obs_flag) {
            if conn.is_split_screen() {
                // split-screen house colours are hard coded
                teams.insert(0);
                teams.insert(1);
            } else {
                teams.insert(conn.house_colour);
            }
        }
        teams.len() as u32
    }

    /// Deterministic per-draw RNG. The draw counter is part of the VM
    /// snapshot, so replicas that replay the same operations draw the
    /// same values.
    pub fn next_rng(&mut self) -> SmallRng {
        self.rng_counter += 1;
        SmallRng::seed_from_u64(self.rng_seed ^ self.rng_counter.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn engine_seed(&mut self) -> u64 {
        use rand::Rng;
        self.next_rng().random()
    }

    // -- broadcast helpers --------------------------------------------------

    pub fn announcement(&mut self, msg: &LocalMsg, is_err: bool) {
        for conn in &mut self.connections {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            if is_err {
                buf.write_ubyte(server_msg::EXTENDED_MESSAGE);
                buf.write_var_int(knights_protocol::ext_msg::NEXT_ANNOUNCEMENT_IS_ERROR as u32);
                buf.write_ushort(0);
            }
            buf.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
            write_local_msg(&mut buf, msg);
        }
    }

    pub fn send_messages(&mut self, messages: &[LocalMsg]) {
        for conn in &mut self.connections {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            for msg in messages {
                buf.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
                write_local_msg(&mut buf, msg);
            }
        }
    }

    pub fn deactivate_ready_flags(&mut self) {
        for conn in &mut self.connections {
            conn.is_ready = false;
            conn.output_data.push(server_msg::DEACTIVATE_READY_FLAGS);
        }
    }

    fn write_available_house_colours(&self, out: &mut Vec<u8>) {
        let cols = self.config.house_colours();
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_AVAILABLE_HOUSE_COLOURS);
        buf.write_ubyte(cols.len() as u8);
        for col in cols {
            buf.write_ubyte(col.r);
            buf.write_ubyte(col.g);
            buf.write_ubyte(col.b);
        }
    }

    /// Applies menu constraints after the player/team count changed and
    /// broadcasts any resulting menu updates.
    pub fn update_num_players_and_teams(&mut self) {
        let nplayers = self.count_players();
        let nteams = self.count_teams();
        let GameCore {
            config,
            connections,
            ..
        } = self;
        let mut listener = MenuBroadcastListener::new(connections);
        config.change_number_of_players(nplayers, nteams, &mut listener);
    }

    // -- join / leave -------------------------------------------------------

    /// Builds the (large) `JoinGameAccepted` message into `out`.
    fn write_join_game_accepted(&mut self, target: usize, already_started: bool) {
        struct Roster {
            id: PlayerId,
            ready: bool,
            colour: u8,
        }

        let mut players = Vec::new();
        let mut observers = Vec::new();
        for conn in &self.connections {
            if conn.obs_flag {
                observers.push(conn.id1.clone());
            } else {
                players.push(Roster {
                    id: conn.id1.clone(),
                    ready: conn.is_ready,
                    colour: conn.house_colour,
                });
                if conn.is_split_screen() {
                    players.push(Roster {
                        id: conn.id2.clone(),
                        ready: conn.is_ready,
                        colour: conn.house_colour + 1,
                    });
                }
            }
        }

        let my_house_colour = self.connections[target].house_colour;
        let manifest = self.config.manifest().clone();
        let approach_offset = self.config.approach_offset();

        {
            let out = &mut self.connections[target].output_data;
            let mut buf = OutputByteBuf::new(out);
            buf.write_ubyte(server_msg::JOIN_GAME_ACCEPTED);

            buf.write_var_int(manifest.graphics.len() as u32);
            for g in &manifest.graphics {
                g.serialize(&mut buf);
            }
            buf.write_var_int(manifest.anims.len() as u32);
            for a in &manifest.anims {
                a.serialize(&mut buf);
            }
            buf.write_var_int(manifest.overlays.len() as u32);
            for o in &manifest.overlays {
                o.serialize(&mut buf);
            }
            buf.write_var_int(manifest.sounds.len() as u32);
            for s in &manifest.sounds {
                s.serialize(&mut buf);
            }
            buf.write_var_int(manifest.standard_controls.len() as u32);
            for c in &manifest.standard_controls {
                c.serialize(&mut buf);
            }
            buf.write_var_int(manifest.other_controls.len() as u32);
            for c in &manifest.other_controls {
                c.serialize(&mut buf);
            }

            // menu structure: item count, then title key + choice count per item
            buf.write_var_int(manifest.menu.len() as u32);
            for item in &manifest.menu {
                buf.write_string(&item.title_key);
                buf.write_var_int(item.choices.len() as u32);
            }

            buf.write_var_int(approach_offset);
            buf.write_ubyte(my_house_colour);

            buf.write_var_int(players.len() as u32);
            for p in &players {
                buf.write_string(p.id.as_str());
                buf.write_ubyte(p.ready as u8);
                buf.write_ubyte(p.colour);
            }
            buf.write_var_int(observers.len() as u32);
            for id in &observers {
                buf.write_string(id.as_str());
            }

            buf.write_ubyte(already_started as u8);
        }

        // current menu selections, then the available house colours
        {
            let GameCore {
                config,
                connections,
                ..
            } = self;
            let mut listener =
                MenuBroadcastListener::new(&mut connections[target..target + 1]);
            config.current_menu_settings(&mut listener);
        }
        let mut tail = Vec::new();
        self.write_available_house_colours(&mut tail);
        self.connections[target].output_data.extend_from_slice(&tail);
    }

    /// Adds a connection to the roster and sends the joining messages.
    /// With an engine running, the newcomer is admitted as an observer
    /// unless their id matches a still-playing knight.
    pub fn add_new_player(&mut self, mut conn: GameConnection, engine_running: bool) {
        let mut observer = false;
        let mut enter_game = false;
        if engine_running {
            observer = true;
            enter_game = true;
            if let Some(engine) = &self.engine {
                for info in engine.player_list() {
                    if info.id == conn.id1 {
                        if matches!(
                            info.state,
                            knights_engine::PlayerState::Disconnected
                                | knights_engine::PlayerState::Normal
                        ) {
                            // actually playing, not just observing
                            observer = false;
                            conn.house_colour = info.house_colour_index;
                            conn.player_num = Some(info.player_num);
                        }
                        break;
                    }
                }
            }
        }
        conn.obs_flag = observer;

        let joined_id1 = conn.id1.clone();
        let joined_id2 = conn.id2.clone();
        let joined_colour = conn.house_colour;
        let target = self.connections.len();
        self.connections.push(conn);

        self.write_join_game_accepted(target, enter_game);

        for (i, other) in self.connections.iter_mut().enumerate() {
            if i == target {
                continue;
            }
            let mut buf = OutputByteBuf::new(&mut other.output_data);
            buf.write_ubyte(server_msg::PLAYER_JOINED_THIS_GAME);
            buf.write_string(joined_id1.as_str());
            buf.write_ubyte(observer as u8);
            buf.write_ubyte(joined_colour);
            if !joined_id2.is_empty() {
                buf.write_ubyte(server_msg::PLAYER_JOINED_THIS_GAME);
                buf.write_string(joined_id2.as_str());
                buf.write_ubyte(observer as u8);
                buf.write_ubyte(joined_colour);
            }
        }

        if enter_game {
            let all_ids = self.all_player_ids.clone();
            let deathmatch = self.deathmatch_mode;
            let game_over = self.game_over;
            let loser = self.sink.as_ref().map(|sink| {
                self.connections[target]
                    .player_num
                    .is_some_and(|p| sink.is_loser(p))
            });
            let conn = &mut self.connections[target];
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            if observer {
                buf.write_ubyte(server_msg::START_GAME_OBS);
                buf.write_ubyte(all_ids.len() as u8);
                buf.write_ubyte(deathmatch as u8);
                for id in &all_ids {
                    buf.write_string(id.as_str());
                }
                buf.write_ubyte(1); // already started
            } else {
                buf.write_ubyte(server_msg::START_GAME);
                buf.write_ubyte(1);
                buf.write_ubyte(deathmatch as u8);
                buf.write_ubyte(1); // already started
            }

            // If the game is over, put a rejoining player straight onto
            // the winner/loser screen.
            if game_over && !observer {
                if loser.unwrap_or(true) {
                    buf.write_ubyte(server_msg::LOSE_GAME);
                } else {
                    buf.write_ubyte(server_msg::WIN_GAME);
                }
            }
        }

        self.update_num_players_and_teams();
    }

    pub fn remember_house_colour(&mut self, id: &PlayerId, colour: u8) {
        if let Some(entry) = self
            .previous_house_colours
            .iter_mut()
            .find(|(prev, _)| prev == id)
        {
            entry.1 = colour;
        } else {
            let slot = self.previous_house_colours_next;
            self.previous_house_colours[slot] = (id.clone(), colour);
            self.previous_house_colours_next = (slot + 1) % HOUSE_COLOUR_MEMORY;
        }
    }

    pub fn recall_house_colour(&self, id: &PlayerId) -> Option<u8> {
        self.previous_house_colours
            .iter()
            .find(|(prev, _)| prev == id && !prev.is_empty())
            .map(|&(_, col)| col)
    }

    /// First house colour not taken by another player.
    pub fn lowest_unused_colour(&self, skip_conn: Option<u64>) -> u8 {
        let ncols = self.config.house_colours().len() as u8;
        let mut col = 0u8;
        while col + 1 < ncols {
            let taken = self.connections.iter().any(|c| {
                Some(c.conn_id) != skip_conn && !c.obs_flag && c.house_colour == col
            });
            if !taken {
                break;
            }
            col += 1;
        }
        col
    }

    /// Sends `GotoMenu` and performs the end-of-game cleanup.
    pub fn return_to_menu(&mut self) {
        for conn in &mut self.connections {
            conn.output_data.push(server_msg::GOTO_MENU);
            conn.observer_num = 0;
            conn.player_num = None;
            if conn.cancel_obs_mode_after_game {
                conn.obs_flag = false;
            }
            conn.cancel_obs_mode_after_game = false;
        }
        self.pause_mode = false;
        info!(game = %self.game_name, "game ended");
    }

    /// Tears the worker down (engine and encoders included).
    pub fn stop_worker(&mut self) {
        self.worker = None;
        self.engine = None;
        self.sink = None;
    }

    pub fn do_set_ready(&mut self, index: usize, ready: bool) {
        self.connections[index].is_ready = ready;
        let id1 = self.connections[index].id1.clone();
        let id2 = self.connections[index].id2.clone();
        for conn in &mut self.connections {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::SET_READY);
            buf.write_string(id1.as_str());
            buf.write_ubyte(ready as u8);
            if !id2.is_empty() {
                buf.write_ubyte(server_msg::SET_READY);
                buf.write_string(id2.as_str());
                buf.write_ubyte(ready as u8);
            }
        }
    }

    /// Starts the game if every player is ready and the quest's strict
    /// player-count check passes.
    pub fn start_game_if_ready(&mut self) {
        if self.is_running() {
            return;
        }

        let mut nready = 0u32;
        let mut nplayers = 0u32;
        let mut ids = Vec::new();
        for conn in &mut self.connections {
            if conn.obs_flag {
                continue;
            }
            let ncount = conn.num_player_slots() as u32;
            conn.player_num = Some(nplayers as usize);
            nplayers += ncount;
            if conn.is_ready {
                nready += ncount;
                ids.push(conn.id1.clone());
                if ncount == 2 {
                    ids.push(conn.id2.clone());
                }
            }
        }

        if nready != nplayers || nplayers < 1 {
            return;
        }

        if let Err(msg) = self
            .config
            .check_num_players_strict(nplayers, self.count_teams())
        {
            self.announcement(&msg, true);
            return;
        }

        // Collect house colours, player ids and team sizes in player-number
        // order (split-screen consumes two consecutive numbers).
        let mut hse_cols = Vec::new();
        let mut player_ids = Vec::new();
        let mut team_counts: BTreeMap<u8, u32> = BTreeMap::new();
        for conn in &self.connections {
            if conn.obs_flag {
                continue;
            }
            let mut col = conn.house_colour;
            hse_cols.push(col);
            *team_counts.entry(col).or_default() += 1;
            player_ids.push(conn.id1.clone());
            if conn.is_split_screen() {
                col += 1;
                hse_cols.push(col);
                *team_counts.entry(col).or_default() += 1;
                player_ids.push(conn.id2.clone());
            }
        }

        self.all_player_ids = player_ids.clone();
        if player_ids.len() == 2 && self.connections.len() == 1 {
            // Split-screen game: suppress the on-screen names.
            player_ids = vec![PlayerId::default(), PlayerId::default()];
        }

        let seed = self.engine_seed();
        let start = match self.config.new_engine(hse_cols.clone(), player_ids, seed) {
            Ok(start) => start,
            Err(err) => {
                let msg = match &err {
                    knights_engine::EngineError::Startup(msg) => msg.clone(),
                    _ => LocalMsg::new("update_thread_failed"),
                };
                self.announcement(&LocalMsg::new("couldnt_start_game"), false);
                self.announcement(&msg, true);
                info!(game = %self.game_name, error = %err, "error starting game");
                return;
            }
        };

        let nplayers_total = hse_cols.len();
        let mut engine = start.engine;
        for conn in self.connections.iter().filter(|c| !c.obs_flag) {
            if let Some(base) = conn.player_num {
                for p in 0..conn.num_player_slots() {
                    engine.set_approach_based_controls(base + p, conn.approach_based_controls);
                    engine.set_action_bar_controls(base + p, conn.action_bar_controls);
                }
            }
        }

        self.deathmatch_mode = start.deathmatch;
        self.engine = Some(engine);
        self.sink = Some(ViewSink::new(nplayers_total));
        self.game_over = false;
        self.pending_disconnections.clear();
        self.fatal_error = None;

        for conn in &mut self.connections {
            conn.finished_loading = false;
            conn.ready_to_end = false;
            conn.is_ready = false;
            // observers always require an initial catch-up
            conn.requires_catchup = conn.obs_flag;
        }

        self.worker = Some(WorkerState::new(
            nplayers_total,
            team_counts,
            start.messages,
            self.clock.now_ms(),
        ));

        // start-game messages
        let all_ids = self.all_player_ids.clone();
        let deathmatch = self.deathmatch_mode;
        for conn in &mut self.connections {
            let num_displays = if conn.is_split_screen() {
                2
            } else if conn.obs_flag {
                nplayers_total as u8
            } else {
                1
            };
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            if conn.obs_flag {
                buf.write_ubyte(server_msg::START_GAME_OBS);
                buf.write_ubyte(num_displays);
                buf.write_ubyte(deathmatch as u8);
                for id in all_ids.iter().take(num_displays as usize) {
                    buf.write_string(id.as_str());
                }
                buf.write_ubyte(0); // not already started
            } else {
                buf.write_ubyte(server_msg::START_GAME);
                buf.write_ubyte(num_displays);
                buf.write_ubyte(deathmatch as u8);
                buf.write_ubyte(0); // not already started
            }
        }

        info!(
            game = %self.game_name,
            players = ?ids.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
            "game started"
        );
    }
}

/// Menu listener that writes `SetMenuSelection` / `SetQuestDescription`
/// updates into every given connection's output buffer.
pub(crate) struct MenuBroadcastListener<'a> {
    conns: &'a mut [GameConnection],
    changed: bool,
}

impl<'a> MenuBroadcastListener<'a> {
    pub fn new(conns: &'a mut [GameConnection]) -> Self {
        MenuBroadcastListener {
            conns,
            changed: false,
        }
    }

    pub fn were_there_changes(&self) -> bool {
        self.changed
    }
}

impl MenuListener for MenuBroadcastListener<'_> {
    fn setting_changed(
        &mut self,
        item_num: u32,
        _item_key: &str,
        choice_num: u32,
        _choice: &MenuChoiceValue,
        allowed_choices: &[u32],
    ) {
        self.changed = true;
        for conn in self.conns.iter_mut() {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::SET_MENU_SELECTION);
            buf.write_var_int(item_num);
            buf.write_var_int(choice_num);
            buf.write_var_int(allowed_choices.len() as u32);
            for &c in allowed_choices {
                buf.write_var_int(c);
            }
        }
    }

    fn quest_description_changed(&mut self, paragraphs: &[LocalMsg]) {
        for conn in self.conns.iter_mut() {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::SET_QUEST_DESCRIPTION);
            buf.write_ubyte(paragraphs.len().min(255) as u8);
            for p in paragraphs.iter().take(255) {
                write_local_msg(&mut buf, p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public wrapper
// ---------------------------------------------------------------------------

pub(crate) struct GameShared {
    pub state: Mutex<GameCore>,
    pub wake: Condvar,
}

/// Serialized session state, as stored in replicated-VM snapshots.
#[derive(Serialize, Deserialize)]
pub struct GameSnapshot {
    game_name: String,
    allow_split_screen: bool,
    connections: Vec<GameConnection>,
    incoming_connections: Vec<GameConnection>,
    deathmatch_mode: bool,
    game_over: bool,
    pause_mode: bool,
    worker: Option<WorkerState>,
    engine_state: Option<Vec<u8>>,
    sink: Option<ViewSink>,
    delete_observer_nums: Vec<u32>,
    pending_disconnections: Vec<usize>,
    all_player_ids: Vec<PlayerId>,
    previous_house_colours: Vec<(PlayerId, u8)>,
    previous_house_colours_next: usize,
    menu: MenuState,
    next_conn_id: u64,
    rng_seed: u64,
    rng_counter: u64,
}

/// A single game of Knights. See the module docs for the locking model.
pub struct KnightsGame {
    shared: Arc<GameShared>,
    mode: WorkerMode,
    worker_thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock(shared: &GameShared) -> MutexGuard<'_, GameCore> {
    // A poisoned lock means a panic elsewhere already set the fatal flag;
    // the state itself is still usable for tear-down.
    shared.state.lock().unwrap_or_else(|e| e.into_inner())
}

impl KnightsGame {
    pub fn new(
        config: GameConfig,
        clock: Arc<dyn Clock>,
        allow_split_screen: bool,
        game_name: String,
        mode: WorkerMode,
        rng_seed: u64,
    ) -> Self {
        let core = GameCore {
            config,
            clock,
            allow_split_screen,
            game_name,
            connections: Vec::new(),
            incoming_connections: Vec::new(),
            deathmatch_mode: false,
            game_over: false,
            pause_mode: false,
            worker: None,
            engine: None,
            sink: None,
            delete_observer_nums: Vec::new(),
            pending_disconnections: Vec::new(),
            all_player_ids: Vec::new(),
            previous_house_colours: vec![(PlayerId::default(), 0); HOUSE_COLOUR_MEMORY],
            previous_house_colours_next: 0,
            wake_up_flag: false,
            worker_thread_active: false,
            fatal_error: None,
            next_conn_id: 1,
            rng_seed,
            rng_counter: 0,
        };
        KnightsGame {
            shared: Arc::new(GameShared {
                state: Mutex::new(core),
                wake: Condvar::new(),
            }),
            mode,
            worker_thread: Mutex::new(None),
        }
    }

    // -- information --------------------------------------------------------

    pub fn num_players(&self) -> u32 {
        lock(&self.shared).count_players()
    }

    pub fn num_observers(&self) -> u32 {
        lock(&self.shared).count_observers()
    }

    pub fn status(&self) -> GameStatus {
        let core = lock(&self.shared);
        if core.is_running() {
            GameStatus::Running
        } else if core.count_players() < 2 {
            GameStatus::WaitingForPlayers
        } else {
            GameStatus::SelectingQuest
        }
    }

    pub fn is_split_screen_allowed(&self) -> bool {
        lock(&self.shared).allow_split_screen
    }

    pub fn obs_flag(&self, conn_id: u64) -> bool {
        let core = lock(&self.shared);
        core.conn_index(conn_id)
            .map(|i| core.connections[i].obs_flag)
            .unwrap_or(false)
    }

    /// The engine-panic flag. The server destroys the session when this
    /// turns up non-empty.
    pub fn take_fatal_error(&self) -> Option<String> {
        lock(&self.shared).fatal_error.take()
    }

    // -- join / leave -------------------------------------------------------

    /// Adds a player or observer connection. `id2` non-empty creates a
    /// split-screen connection (if the game allows it).
    pub fn new_client_connection(
        &self,
        id1: PlayerId,
        id2: PlayerId,
        client_version: u32,
        approach_based_controls: bool,
        action_bar_controls: bool,
    ) -> Result<u64, SessionError> {
        let mut core = lock(&self.shared);

        if id1.is_empty() {
            return Err(SessionError::denied("invalid_player_id"));
        }
        for conn in core.connections.iter().chain(&core.incoming_connections) {
            if conn.id1 == id1 || conn.id2 == id1 {
                return Err(SessionError::denied("already_in_game"));
            }
            if !id2.is_empty() && (conn.id1 == id2 || conn.id2 == id2) {
                return Err(SessionError::denied("already_in_game"));
            }
        }
        if !id2.is_empty() && !core.allow_split_screen {
            return Err(SessionError::denied("split_screen_not_allowed"));
        }
        if !id2.is_empty() && !core.connections.is_empty() {
            return Err(SessionError::denied("split_screen_too_many"));
        }

        let conn_id = core.next_conn_id;
        core.next_conn_id += 1;
        let mut conn = GameConnection::new(
            conn_id,
            id1.clone(),
            id2,
            false,
            client_version,
            approach_based_controls,
            action_bar_controls,
        );

        if core.is_running() {
            // admitted by the worker's next pre-update
            conn.requires_catchup = true;
            core.incoming_connections.push(conn);
            drop(core);
            self.notify_worker();
            return Ok(conn_id);
        }

        // Restore the colour from a previous visit, otherwise pick the
        // first free one.
        conn.house_colour = match core.recall_house_colour(&id1) {
            Some(col) => col,
            None => core.lowest_unused_colour(None),
        };

        core.add_new_player(conn, false);
        Ok(conn_id)
    }

    /// Removes a connection from the game (returning to the lobby or
    /// leaving the server).
    pub fn client_left_game(&self, conn_id: u64) {
        let mut start_check = false;
        {
            let mut core = lock(&self.shared);

            // It might still be queued in the pending-join list.
            if let Some(pos) = core
                .incoming_connections
                .iter()
                .position(|c| c.conn_id == conn_id)
            {
                core.incoming_connections.remove(pos);
                return;
            }

            let Some(index) = core.conn_index(conn_id) else {
                return;
            };
            let conn = core.connections.remove(index);
            let is_player = !conn.obs_flag;

            if conn.observer_num > 0 {
                core.delete_observer_nums.push(conn.observer_num);
            }
            if is_player {
                core.remember_house_colour(&conn.id1, conn.house_colour);
            }

            let running = core.is_running();
            if is_player && running {
                if let Some(player_num) = conn.player_num {
                    core.pending_disconnections.push(player_num);
                }
                let players_left = core.connections.iter().any(|c| !c.obs_flag);
                if !players_left {
                    // last player gone: stop the quest
                    core.stop_worker();
                    core.return_to_menu();
                }
            }

            for other in &mut core.connections {
                let mut buf = OutputByteBuf::new(&mut other.output_data);
                buf.write_ubyte(server_msg::PLAYER_LEFT_THIS_GAME);
                buf.write_string(conn.id1.as_str());
                buf.write_ubyte(conn.obs_flag as u8);
                if !conn.id2.is_empty() {
                    buf.write_ubyte(server_msg::PLAYER_LEFT_THIS_GAME);
                    buf.write_string(conn.id2.as_str());
                    buf.write_ubyte(conn.obs_flag as u8);
                }
            }

            if core.connections.is_empty() {
                core.config.reset_menu();
            } else if is_player {
                core.update_num_players_and_teams();
            }

            // If all remaining players are ready, the game should start.
            start_check = !core.connections.is_empty();
            if start_check {
                core.start_game_if_ready();
                start_check = core.is_running();
            }
        }
        if start_check {
            self.spawn_worker_if_needed();
        }
        self.notify_worker();
    }

    // -- lobby operations ---------------------------------------------------

    pub fn send_chat_message(&self, conn_id: u64, msg_orig: &str) {
        let mut core = lock(&self.shared);
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        let running = core.is_running();
        let sender_obs = core.connections[index].obs_flag;
        let sender_colour = core.connections[index].house_colour;
        let sender_id = core.connections[index].id1.clone();

        // `/t ` prefix (after left-trim) restricts to team mates; team
        // chat is unavailable on the menu and to observers.
        let (msg, is_team) = if running && !sender_obs {
            parse_team_chat(msg_orig)
        } else {
            (msg_orig.trim_start().to_owned(), false)
        };

        let kind = if is_team {
            ChatKind::Team
        } else if sender_obs {
            ChatKind::Observer
        } else {
            ChatKind::Player
        };

        for conn in &mut core.connections {
            if is_team && (conn.obs_flag || conn.house_colour != sender_colour) {
                continue;
            }
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::CHAT);
            buf.write_string(sender_id.as_str());
            buf.write_ubyte(kind as u8);
            buf.write_string(&msg);
        }
    }

    pub fn set_ready(&self, conn_id: u64, ready: bool) {
        let started = {
            let mut core = lock(&self.shared);
            if core.is_running() {
                return;
            }
            let Some(index) = core.conn_index(conn_id) else {
                return;
            };
            if core.connections[index].obs_flag {
                return;
            }
            core.do_set_ready(index, ready);
            core.start_game_if_ready();
            core.is_running()
        };
        if started {
            self.spawn_worker_if_needed();
        }
    }

    pub fn set_house_colour(&self, conn_id: u64, colour: u8) {
        let mut core = lock(&self.shared);
        if core.is_running() {
            return;
        }
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        if core.connections[index].obs_flag {
            return;
        }
        if colour as usize >= core.config.house_colours().len() {
            return;
        }
        core.connections[index].house_colour = colour;
        let id = core.connections[index].id1.clone();
        for conn in &mut core.connections {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::SET_HOUSE_COLOUR);
            buf.write_string(id.as_str());
            buf.write_ubyte(colour);
        }
        core.update_num_players_and_teams();
    }

    pub fn set_obs_flag(&self, conn_id: u64, new_obs_flag: bool) {
        let mut core = lock(&self.shared);
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        if core.connections[index].obs_flag == new_obs_flag {
            return;
        }

        if core.is_running() {
            let conn = &mut core.connections[index];
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
            write_local_msg(&mut buf, &LocalMsg::new("cant_change_obs"));
            return;
        }

        if new_obs_flag && core.connections[index].is_ready {
            core.do_set_ready(index, false);
        }

        let new_col = if new_obs_flag {
            0
        } else {
            core.lowest_unused_colour(Some(conn_id))
        };

        core.connections[index].obs_flag = new_obs_flag;
        core.connections[index].house_colour = new_col;
        let id = core.connections[index].id1.clone();
        for conn in &mut core.connections {
            let mut buf = OutputByteBuf::new(&mut conn.output_data);
            buf.write_ubyte(server_msg::SET_OBS_FLAG);
            buf.write_string(id.as_str());
            buf.write_ubyte(new_obs_flag as u8);
            if !new_obs_flag {
                buf.write_ubyte(server_msg::SET_HOUSE_COLOUR);
                buf.write_string(id.as_str());
                buf.write_ubyte(new_col);
            }
        }

        core.update_num_players_and_teams();
    }

    pub fn set_menu_selection(&self, conn_id: u64, item_num: u32, choice_num: u32) {
        let mut core = lock(&self.shared);
        if core.is_running() {
            return;
        }
        if item_num >= core.config.num_menu_items()
            || choice_num >= core.config.num_choices(item_num)
        {
            return;
        }
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        if core.connections[index].obs_flag {
            return; // only players adjust the menu
        }
        let player_id = core.connections[index].id1.clone();

        let changed = {
            let GameCore {
                config,
                connections,
                ..
            } = &mut *core;
            let mut listener = MenuBroadcastListener::new(connections);
            config.change_menu_setting(item_num, choice_num, &mut listener);
            listener.were_there_changes()
        };

        if changed {
            let msg = LocalMsg::with_params(
                "player_set_menu",
                vec![
                    LocalParam::Player(player_id),
                    LocalParam::Int(item_num as i32),
                    LocalParam::Int(choice_num as i32),
                ],
            );
            core.announcement(&msg, false);
            core.deactivate_ready_flags();
        }
    }

    pub fn random_quest(&self, conn_id: u64) {
        let mut core = lock(&self.shared);
        if core.is_running() {
            return;
        }
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        if core.connections[index].obs_flag {
            return;
        }
        let player_id = core.connections[index].id1.clone();

        let mut rng = core.next_rng();
        {
            let GameCore {
                config,
                connections,
                ..
            } = &mut *core;
            let mut listener = MenuBroadcastListener::new(connections);
            config.random_quest(&mut rng, &mut listener);
        }

        let msg =
            LocalMsg::with_params("player_set_random", vec![LocalParam::Player(player_id)]);
        core.announcement(&msg, false);
        core.deactivate_ready_flags();
    }

    // -- in-game operations -------------------------------------------------

    pub fn finished_loading(&self, conn_id: u64) {
        let mut core = lock(&self.shared);
        if let Some(index) = core.conn_index(conn_id) {
            core.connections[index].finished_loading = true;
            core.wake_up_flag = true;
        }
        drop(core);
        self.notify_worker();
    }

    pub fn send_control(&self, conn_id: u64, player_slot: u8, control_num: u8) {
        let mut core = lock(&self.shared);
        if !core.is_running() {
            return;
        }
        let continuous = core
            .config
            .control_by_num(control_num)
            .is_some_and(|c| c.continuous);
        let Some(index) = core.conn_index(conn_id) else {
            return;
        };
        let conn = &mut core.connections[index];
        if conn.obs_flag || player_slot as usize >= conn.num_player_slots() {
            return;
        }
        let queue = &mut conn.control_queue[player_slot as usize];
        // continuous controls elide contiguous repeats
        if continuous && queue.last() == Some(&control_num) {
            return;
        }
        if queue.len() == CONTROL_QUEUE_MAX {
            queue.remove(0);
        }
        queue.push(control_num);
        core.wake_up_flag = true;
    }

    pub fn request_speech_bubble(&self, conn_id: u64, show: bool) {
        let mut core = lock(&self.shared);
        if !core.is_running() {
            return;
        }
        if let Some(index) = core.conn_index(conn_id) {
            let conn = &mut core.connections[index];
            if !conn.obs_flag {
                conn.speech_request = true;
                conn.speech_bubble = show;
                core.wake_up_flag = true;
            }
        }
    }

    /// Call after a batch of `send_control` / `request_speech_bubble`
    /// calls: wakes the worker so the inputs reach the engine promptly.
    pub fn end_of_message_packet(&self) {
        let flagged = lock(&self.shared).wake_up_flag;
        if flagged {
            self.notify_worker();
        }
    }

    pub fn ready_to_end(&self, conn_id: u64) {
        let all_ready = {
            let mut core = lock(&self.shared);
            if !core.game_over {
                return;
            }
            let Some(index) = core.conn_index(conn_id) else {
                return;
            };
            if core.connections[index].obs_flag {
                return;
            }
            core.connections[index].ready_to_end = true;

            let all_ready = core
                .connections
                .iter()
                .filter(|c| !c.obs_flag)
                .all(|c| c.ready_to_end);

            if all_ready {
                core.stop_worker();
                core.return_to_menu();
            } else {
                let id = core.connections[index].id1.clone();
                for conn in &mut core.connections {
                    let mut buf = OutputByteBuf::new(&mut conn.output_data);
                    buf.write_ubyte(server_msg::READY_TO_END);
                    buf.write_string(id.as_str());
                }
            }
            all_ready
        };
        if all_ready {
            self.notify_worker();
        }
    }

    /// Pause only applies to split-screen games; it suspends simulation
    /// progress without stopping the clock.
    pub fn set_pause_mode(&self, paused: bool) {
        let mut core = lock(&self.shared);
        if core.allow_split_screen {
            core.pause_mode = paused;
        }
    }

    pub fn set_ping_time(&self, conn_id: u64, ping_ms: u32) {
        let mut core = lock(&self.shared);
        if let Some(index) = core.conn_index(conn_id) {
            core.connections[index].ping_time = ping_ms;
        }
    }

    /// Takes everything queued for one connection.
    pub fn get_output_data(&self, conn_id: u64) -> Vec<u8> {
        let mut core = lock(&self.shared);
        match core.conn_index(conn_id) {
            Some(index) => std::mem::take(&mut core.connections[index].output_data),
            None => Vec::new(),
        }
    }

    // -- worker driving -----------------------------------------------------

    fn notify_worker(&self) {
        if self.mode == WorkerMode::Threaded {
            self.shared.wake.notify_one();
        }
    }

    fn spawn_worker_if_needed(&self) {
        if self.mode != WorkerMode::Threaded {
            return;
        }
        {
            let mut core = lock(&self.shared);
            if !core.is_running() || core.worker_thread_active {
                // either nothing to drive, or a live thread will pick
                // the new worker state up on its next wake
                return;
            }
            core.worker_thread_active = true;
        }

        let mut handle = self
            .worker_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Reap the thread from a previous game; it has committed to
        // exiting (the active flag was clear), so this join is brief.
        if let Some(old) = handle.take() {
            let _ = old.join();
        }
        let shared = Arc::clone(&self.shared);
        *handle = Some(
            std::thread::Builder::new()
                .name("knights-game-worker".into())
                .spawn(move || worker::worker_thread_main(&shared))
                .expect("spawning the game worker thread"),
        );
    }

    /// Cooperative driver: runs one worker step if a game is active.
    /// Returns the time at which the next step is due.
    pub fn pump(&self, now_ms: u64) -> Option<u64> {
        debug_assert_eq!(self.mode, WorkerMode::Cooperative);
        let mut core = lock(&self.shared);
        if core.worker.is_none() {
            return None;
        }
        core.wake_up_flag = false;
        worker::run_worker(&mut core, now_ms)
    }

    /// Stops the worker (if any) and waits for its thread to exit.
    pub fn shutdown(&self) {
        {
            let mut core = lock(&self.shared);
            core.stop_worker();
        }
        self.shared.wake.notify_one();
        let handle = self
            .worker_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // -- replication support ------------------------------------------------

    /// Serializable copy of the whole session state.
    pub fn snapshot(&self) -> GameSnapshot {
        let core = lock(&self.shared);
        GameSnapshot {
            game_name: core.game_name.clone(),
            allow_split_screen: core.allow_split_screen,
            connections: core.connections.clone(),
            incoming_connections: core.incoming_connections.clone(),
            deathmatch_mode: core.deathmatch_mode,
            game_over: core.game_over,
            pause_mode: core.pause_mode,
            worker: core.worker.clone(),
            engine_state: core.engine.as_ref().map(|e| e.save_state()),
            sink: core.sink.clone(),
            delete_observer_nums: core.delete_observer_nums.clone(),
            pending_disconnections: core.pending_disconnections.clone(),
            all_player_ids: core.all_player_ids.clone(),
            previous_house_colours: core.previous_house_colours.clone(),
            previous_house_colours_next: core.previous_house_colours_next,
            menu: core.config.menu_state().clone(),
            next_conn_id: core.next_conn_id,
            rng_seed: core.rng_seed,
            rng_counter: core.rng_counter,
        }
    }

    /// Rebuilds a session from a snapshot, against a fresh `GameConfig`
    /// from the local manifest.
    pub fn from_snapshot(
        mut config: GameConfig,
        clock: Arc<dyn Clock>,
        mode: WorkerMode,
        snap: GameSnapshot,
    ) -> Result<Self, SessionError> {
        config.set_menu_state(snap.menu);
        let engine = match &snap.engine_state {
            Some(bytes) => Some(
                config
                    .restore_engine(bytes)
                    .map_err(|e| SessionError::Fatal(e.to_string()))?,
            ),
            None => None,
        };

        let game = KnightsGame::new(
            config,
            clock,
            snap.allow_split_screen,
            snap.game_name,
            mode,
            snap.rng_seed,
        );
        {
            let mut core = lock(&game.shared);
            core.connections = snap.connections;
            core.incoming_connections = snap.incoming_connections;
            core.deathmatch_mode = snap.deathmatch_mode;
            core.game_over = snap.game_over;
            core.pause_mode = snap.pause_mode;
            core.worker = snap.worker;
            core.engine = engine;
            core.sink = snap.sink;
            core.delete_observer_nums = snap.delete_observer_nums;
            core.pending_disconnections = snap.pending_disconnections;
            core.all_player_ids = snap.all_player_ids;
            core.previous_house_colours = snap.previous_house_colours;
            core.previous_house_colours_next = snap.previous_house_colours_next;
            core.next_conn_id = snap.next_conn_id;
            core.rng_counter = snap.rng_counter;
        }
        // a restored running game needs its worker driven again
        game.spawn_worker_if_needed();
        Ok(game)
    }
}

impl Drop for KnightsGame {
    fn drop(&mut self) {
        // Stop the worker; the thread exits after its current update, so
        // this never blocks for long.
        self.shutdown();
    }
}

/// Splits a `/t`-prefixed chat message. Returns the stripped message and
/// whether it was addressed to the team.
fn parse_team_chat(msg: &str) -> (String, bool) {
    let trimmed = msg.trim_start_matches(' ');
    if let Some(rest) = trimmed.strip_prefix("/t") {
        (rest.trim_start_matches(' ').to_owned(), true)
    } else {
        (trimmed.to_owned(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_chat_prefix_parsing() {
        assert_eq!(parse_team_chat("  /t  hello"), ("hello".into(), true));
        assert_eq!(parse_team_chat("/thi"), ("hi".into(), true));
        assert_eq!(parse_team_chat("  plain"), ("plain".into(), false));
        assert_eq!(parse_team_chat("t/ not team"), ("t/ not team".into(), false));
    }
}
