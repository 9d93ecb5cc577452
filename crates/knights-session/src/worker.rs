//! The simulation worker: the update cycle that drives a running game.
//!
//! The worker tracks two clocks, both in milliseconds: the wall clock and
//! the dungeon clock, with the invariant `dungeon_time <= wall_time`. Each
//! cycle it simulates the dungeon forward to catch up with the wall clock
//! (capping a single engine update at one second, but always advancing the
//! dungeon clock by the full gap so catch-up accounting stays correct),
//! then sleeps until the engine wants its next update or an input wakes
//! it.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use knights_protocol::{
    server_msg, write_local_msg, LocalMsg, OutputByteBuf, PlayerId, PlayerListState,
};

use knights_engine::PlayerState;

use crate::game::{GameCore, GameShared};
use crate::{FORCE_QUIT_TIMEOUT_MS, PLAYER_LIST_INTERVAL_MS};

/// Engine updates are capped at this much simulated time per call.
const MAX_UPDATE_MS: u64 = 1000;

/// Poll interval while waiting for clients to finish loading.
const LOADING_POLL_MS: u64 = 100;

/// The engine is asked for its preferred delay, clamped into this range:
/// at least one update every 250 ms keeps things moving, and at least
/// 1 ms between updates avoids busy-waiting on a stalled timer.
const MIN_UPDATE_DELAY_MS: u64 = 1;
const MAX_UPDATE_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WorkerPhase {
    WaitingForLoaders,
    Playing,
}

/// Worker state, saved explicitly so the cooperative (VM) driver can
/// resume the correct point each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerState {
    pub phase: WorkerPhase,
    pub nplayers: usize,
    pub team_counts: BTreeMap<u8, u32>,
    /// Engine startup messages, delivered once everyone has loaded.
    pub startup_messages: Vec<LocalMsg>,
    pub dungeon_time: u64,
    pub time_to_player_list_update: i64,
    /// Counts down from the first win/lose report; expiry forces the
    /// winner screen closed.
    pub time_to_force_quit: Option<i64>,
    pub game_over_sent: bool,
    pub pings: BTreeMap<PlayerId, u32>,
}

impl WorkerState {
    pub fn new(
        nplayers: usize,
        team_counts: BTreeMap<u8, u32>,
        startup_messages: Vec<LocalMsg>,
        now_ms: u64,
    ) -> Self {
        WorkerState {
            phase: WorkerPhase::WaitingForLoaders,
            nplayers,
            team_counts,
            startup_messages,
            dungeon_time: now_ms,
            time_to_player_list_update: 0,
            time_to_force_quit: None,
            game_over_sent: false,
            pings: BTreeMap::new(),
        }
    }
}

enum StepResult {
    /// Keep going; next update is due at the given time.
    Continue(u64),
    /// The game ended normally; the worker is done.
    Finished,
    /// The engine panicked; the session is unusable.
    Fatal(String),
}

/// Runs one worker cycle. Returns the next wake-up deadline, or `None`
/// when the worker has finished (game ended or failed).
pub(crate) fn run_worker(core: &mut GameCore, now_ms: u64) -> Option<u64> {
    let Some(mut worker) = core.worker.take() else {
        return None;
    };

    match step(core, &mut worker, now_ms) {
        StepResult::Continue(deadline) => {
            core.worker = Some(worker);
            Some(deadline)
        }
        StepResult::Finished => {
            core.engine = None;
            core.sink = None;
            None
        }
        StepResult::Fatal(what) => {
            error!(game = %core.game_name, error = %what, "engine failed; session is fatal");
            let msg = LocalMsg::new("unknown_error");
            for conn in &mut core.connections {
                let mut buf = OutputByteBuf::new(&mut conn.output_data);
                buf.write_ubyte(server_msg::ERROR);
                write_local_msg(&mut buf, &msg);
            }
            core.engine = None;
            core.sink = None;
            core.fatal_error = Some(what);
            None
        }
    }
}

fn step(core: &mut GameCore, worker: &mut WorkerState, now_ms: u64) -> StepResult {
    if worker.phase == WorkerPhase::WaitingForLoaders {
        let all_loaded = core
            .connections
            .iter()
            .filter(|c| !c.obs_flag)
            .all(|c| c.finished_loading);
        if !all_loaded {
            return StepResult::Continue(now_ms + LOADING_POLL_MS);
        }

        worker.phase = WorkerPhase::Playing;
        worker.dungeon_time = now_ms;

        let messages = std::mem::take(&mut worker.startup_messages);
        core.send_messages(&messages);

        // Mention team chat to anyone who actually has a team mate.
        for conn in &mut core.connections {
            if !conn.obs_flag
                && worker
                    .team_counts
                    .get(&conn.house_colour)
                    .copied()
                    .unwrap_or(0)
                    > 1
            {
                let mut buf = OutputByteBuf::new(&mut conn.output_data);
                buf.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
                write_local_msg(&mut buf, &LocalMsg::new("team_chat_avail"));
            }
        }
    }

    let delta = now_ms.saturating_sub(worker.dungeon_time);
    if delta > 0 {
        let capped = delta.min(MAX_UPDATE_MS) as u32;

        let proceed = pre_update(core, worker);
        if proceed {
            let update_ok = {
                let GameCore { engine, sink, .. } = core;
                let (Some(engine), Some(sink)) = (engine.as_mut(), sink.as_mut()) else {
                    return StepResult::Finished;
                };
                catch_unwind(AssertUnwindSafe(|| engine.update(capped, &mut *sink)))
            };
            if let Err(panic) = update_ok {
                let what = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "engine panic".to_owned());
                return StepResult::Fatal(what);
            }

            if !post_update(core, worker, capped as i64) {
                return StepResult::Finished;
            }
        }

        // Advance by the full gap even when the engine update was capped.
        worker.dungeon_time += delta;
    }

    let delay = core
        .engine
        .as_ref()
        .map_or(MAX_UPDATE_DELAY_MS, |e| e.time_to_next_update_ms() as u64)
        .clamp(MIN_UPDATE_DELAY_MS, MAX_UPDATE_DELAY_MS);
    StepResult::Continue(now_ms + delay)
}

/// Roster maintenance before the engine update. Returns false when the
/// game is paused and the update should be skipped.
fn pre_update(core: &mut GameCore, _worker: &WorkerState) -> bool {
    // Admit joins that arrived while the game was running.
    for conn in std::mem::take(&mut core.incoming_connections) {
        core.add_new_player(conn, true);
    }

    let GameCore {
        engine,
        sink,
        connections,
        delete_observer_nums,
        pending_disconnections,
        all_player_ids,
        pause_mode,
        allow_split_screen,
        ..
    } = core;
    let (Some(engine), Some(sink)) = (engine.as_mut(), sink.as_mut()) else {
        return false;
    };

    for obs_num in std::mem::take(delete_observer_nums) {
        sink.rm_observer_num(obs_num);
    }

    for player_num in std::mem::take(pending_disconnections) {
        engine.change_player_state(player_num, PlayerState::Disconnected);
    }

    // Eliminated players go into observer mode, keeping their player
    // number so their score line stays visible.
    for player_num in sink.take_players_to_put_into_obs_mode() {
        for conn in connections.iter_mut() {
            if conn.player_num == Some(player_num) && !conn.obs_flag {
                let mut buf = OutputByteBuf::new(&mut conn.output_data);
                buf.write_ubyte(server_msg::GO_INTO_OBS_MODE);
                buf.write_ubyte(all_player_ids.len() as u8);
                for id in all_player_ids.iter() {
                    buf.write_string(id.as_str());
                }
                conn.obs_flag = true;
                conn.observer_num = 0;
                conn.cancel_obs_mode_after_game = true;
            }
        }
    }

    // Pausing is only allowed in split-screen mode.
    if *pause_mode && *allow_split_screen {
        return false;
    }

    // Catch up new observers and reconnecting players.
    let nplayers = sink.num_players();
    for conn in connections.iter_mut() {
        if !(conn.requires_catchup && conn.finished_loading) {
            continue;
        }
        if conn.obs_flag {
            for p in 0..nplayers {
                conn.output_data.push(server_msg::SWITCH_PLAYER);
                conn.output_data.push(p as u8);
                // The catch-up bytes land in the shared per-player
                // streams; the force flag keeps re-sent tiles from being
                // dropped by other observers' seen-caches.
                engine.catch_up(p, &mut *sink);
            }
            conn.observer_num = sink.alloc_observer_num();
        } else if let Some(player_num) = conn.player_num {
            engine.catch_up(player_num, &mut *sink);
            engine.change_player_state(player_num, PlayerState::Normal);
        }
        conn.requires_catchup = false;
    }

    true
}

/// Post-update work: feed controls, flush encoder output, refresh the
/// player list, and watch for game over. Returns false when the game loop
/// should end.
fn post_update(core: &mut GameCore, worker: &mut WorkerState, time_delta: i64) -> bool {
    {
        let GameCore {
            engine,
            sink: _,
            connections,
            config,
            ..
        } = core;
        let Some(engine) = engine.as_mut() else {
            return false;
        };

        // Drain queued controls: all are applied in order, and a trailing
        // continuous control is re-queued so it stays held next tick.
        for conn in connections.iter_mut() {
            if conn.obs_flag {
                continue;
            }
            let Some(base) = conn.player_num else {
                continue;
            };
            for p in 0..conn.num_player_slots() {
                let queue = std::mem::take(&mut conn.control_queue[p]);
                let mut final_ctrl: Option<u8> = None;
                for num in &queue {
                    final_ctrl = Some(*num);
                    engine.set_control(base + p, config.control_by_num(*num));
                }
                if let Some(num) = final_ctrl {
                    if config.control_by_num(num).is_some_and(|c| c.continuous) {
                        conn.control_queue[p].push(num);
                    }
                }
            }

            if conn.speech_request {
                conn.speech_request = false;
                engine.set_speech_bubble(base, conn.speech_bubble);
            }
        }
    }

    // Flush encoder output into connection buffers.
    {
        let GameCore {
            sink, connections, ..
        } = core;
        let Some(sink) = sink.as_mut() else {
            return false;
        };
        for conn in connections.iter_mut() {
            if !conn.finished_loading {
                continue;
            }
            if conn.obs_flag {
                if conn.observer_num > 0 {
                    sink.append_observer_cmds(conn.observer_num, &mut conn.output_data);
                }
            } else if let Some(base) = conn.player_num {
                if conn.is_split_screen() {
                    for p in 0..2 {
                        conn.output_data.push(server_msg::SWITCH_PLAYER);
                        conn.output_data.push(p as u8);
                        let before = conn.output_data.len();
                        sink.append_player_cmds(base + p, &mut conn.output_data);
                        if conn.output_data.len() == before {
                            conn.output_data.pop();
                            conn.output_data.pop();
                        }
                    }
                } else {
                    sink.append_player_cmds(base, &mut conn.output_data);
                }
            }
        }
        sink.clear_cmds();
    }

    // Player list refresh: every few seconds, or at once when dirtied.
    worker.time_to_player_list_update -= time_delta;
    let timer_expired = worker.time_to_player_list_update <= 0;
    let dirty = core
        .engine
        .as_mut()
        .is_some_and(|e| e.take_player_list_dirty());
    if dirty || timer_expired {
        do_player_list_update(core, worker, timer_expired);
        if timer_expired {
            worker.time_to_player_list_update = PLAYER_LIST_INTERVAL_MS as i64;
        }
    }

    // Detect game over and start the force-quit countdown.
    if !worker.game_over_sent {
        let over = core.sink.as_ref().is_some_and(|s| s.is_game_over());
        if over {
            core.game_over = true;
            worker.game_over_sent = true;
            worker.time_to_force_quit = Some(FORCE_QUIT_TIMEOUT_MS as i64);

            let winner = core.sink.as_ref().and_then(|s| s.winner_num());
            let winner_id = winner.and_then(|w| {
                core.connections
                    .iter()
                    .find(|c| c.player_num == Some(w))
                    .map(|c| c.id1.clone())
            });
            info!(
                game = %core.game_name,
                winner = winner_id.as_ref().map(|id| id.as_str()).unwrap_or("<none>"),
                "game won"
            );
        }
    }

    // Force the winner/loser screen closed after the timeout.
    if let Some(t) = &mut worker.time_to_force_quit {
        *t -= time_delta;
        if *t <= 0 {
            core.return_to_menu();
            return false;
        }
    }

    true
}

fn do_player_list_update(core: &mut GameCore, worker: &mut WorkerState, refresh_pings: bool) {
    let Some(engine) = core.engine.as_ref() else {
        return;
    };
    let mut player_list = engine.player_list();

    // Former players who left for good are dropped; temporarily
    // disconnected ones stay, since they might come back.
    player_list.retain(|info| {
        let connected = core
            .connections
            .iter()
            .any(|c| c.player_num == Some(info.player_num));
        connected || matches!(info.state, PlayerState::Disconnected)
    });

    // Only sample pings on the timer, not on death-triggered refreshes;
    // pings jumping around just because somebody died looks wrong.
    if refresh_pings {
        for info in &player_list {
            if let Some(conn) = core
                .connections
                .iter()
                .find(|c| c.player_num == Some(info.player_num))
            {
                worker.pings.insert(info.id.clone(), conn.ping_time);
            }
        }
    }

    // Observers are appended with blank scores.
    struct Row {
        id: PlayerId,
        rgb: (u8, u8, u8),
        kills: u32,
        deaths: u32,
        frags: u32,
        state: PlayerListState,
    }
    let mut rows: Vec<Row> = player_list
        .iter()
        .map(|info| Row {
            id: info.id.clone(),
            rgb: (info.house_colour.r, info.house_colour.g, info.house_colour.b),
            kills: info.kills,
            deaths: info.deaths,
            frags: info.frags.max(0) as u32,
            state: match info.state {
                PlayerState::Normal => PlayerListState::Normal,
                PlayerState::Eliminated => PlayerListState::Eliminated,
                PlayerState::Disconnected => PlayerListState::Disconnected,
            },
        })
        .collect();
    for conn in core.connections.iter().filter(|c| c.player_num.is_none()) {
        rows.push(Row {
            id: conn.id1.clone(),
            rgb: (0, 0, 0),
            kills: 0,
            deaths: 0,
            frags: 0,
            state: PlayerListState::Observer,
        });
        worker.pings.insert(conn.id1.clone(), conn.ping_time);
    }

    let time_remaining = engine.time_remaining_ms();

    for conn in &mut core.connections {
        let mut buf = OutputByteBuf::new(&mut conn.output_data);
        buf.write_ubyte(server_msg::PLAYER_LIST);
        buf.write_var_int(rows.len() as u32);
        for row in &rows {
            buf.write_string(row.id.as_str());
            buf.write_ubyte(row.rgb.0);
            buf.write_ubyte(row.rgb.1);
            buf.write_ubyte(row.rgb.2);
            buf.write_var_int(row.kills);
            buf.write_var_int(row.deaths);
            buf.write_var_int(row.frags);
            buf.write_var_int(worker.pings.get(&row.id).copied().unwrap_or(0));
            buf.write_ubyte(row.state as u8);
        }
        if let Some(tr) = time_remaining {
            buf.write_ubyte(server_msg::TIME_REMAINING);
            buf.write_var_int(tr);
        }
    }
}

/// Worker thread body for [`WorkerMode::Threaded`] games. Holds the
/// session lock for each update and sleeps on the condition variable in
/// between; `wake_up_flag` is set under the lock by input handlers and
/// cleared here after each observed wake.
///
/// [`WorkerMode::Threaded`]: crate::WorkerMode::Threaded
pub(crate) fn worker_thread_main(shared: &GameShared) {
    let mut guard = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    let clock: Arc<dyn crate::Clock> = Arc::clone(&guard.clock);

    'worker: loop {
        if guard.worker.is_none() {
            break;
        }

        let now = clock.now_ms();
        let Some(deadline) = run_worker(&mut guard, now) else {
            break;
        };

        // Sleep until the deadline or a wake-up, whichever comes first.
        loop {
            let wait = deadline.saturating_sub(clock.now_ms());
            if wait == 0 {
                break;
            }
            let (g, _) = shared
                .wake
                .wait_timeout(guard, Duration::from_millis(wait))
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
            if guard.worker.is_none() {
                break 'worker;
            }
            if guard.wake_up_flag {
                guard.wake_up_flag = false;
                break;
            }
            // spurious wake: loop and re-check the deadline
        }
    }

    // Commit to exiting while still holding the lock, so the owner knows
    // a fresh thread is needed for the next game.
    guard.worker_thread_active = false;
}
