//! `KnightsServer`: handshake, routing and the game directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use knights_engine::GameConfig;
use knights_protocol::{
    client_msg, server_msg, write_local_msg, ChatKind, ControlByte, GameInfo, GameStatus,
    InputByteBuf, LocalKey, LocalMsg, OutputByteBuf, PlayerId, ProtocolError,
    COMPATIBLE_VERSION, PROTOCOL_VERSION, VERSION_STRING_PREFIX,
};
use knights_session::{Clock, GameSnapshot, KnightsGame, SessionError, WorkerMode};

use crate::connection::ServerConn;
use crate::error::ServerError;
use crate::{MAX_PASSWORD_ATTEMPTS, PASSWORD_RETRY_DELAY_MS, RATE_LIMIT_BYTES, RATE_LIMIT_WINDOW_MS};

/// Construction parameters for a [`KnightsServer`].
pub struct ServerParams {
    pub clock: Arc<dyn Clock>,
    pub worker_mode: WorkerMode,
    pub allow_split_screen: bool,
    /// Message of the day, sent right after version acceptance.
    pub motd: Option<String>,
    /// Variant served to clients older than the current version.
    pub old_motd: Option<String>,
    /// When set, clients must pass a `SendPassword` exchange.
    pub password: Option<String>,
    /// Seed for everything random the server does (game seeds in
    /// particular). Replicas must agree on it.
    pub rng_seed: u64,
}

/// A Knights server hosting multiple games.
pub struct KnightsServer {
    clock: Arc<dyn Clock>,
    worker_mode: WorkerMode,
    allow_split_screen: bool,
    motd: Option<String>,
    old_motd: Option<String>,
    password: Option<String>,

    games: BTreeMap<String, KnightsGame>,
    connections: BTreeMap<u64, ServerConn>,
    next_conn_id: u64,

    rng_seed: u64,
    game_seed_counter: u64,
}

impl KnightsServer {
    pub fn new(params: ServerParams) -> Self {
        KnightsServer {
            clock: params.clock,
            worker_mode: params.worker_mode,
            allow_split_screen: params.allow_split_screen,
            motd: params.motd,
            old_motd: params.old_motd,
            password: params.password,
            games: BTreeMap::new(),
            connections: BTreeMap::new(),
            next_conn_id: 1,
            rng_seed: params.rng_seed,
            game_seed_counter: 0,
        }
    }

    // -- connection lifecycle -----------------------------------------------

    /// Registers a newly accepted connection; returns its handle.
    pub fn new_client_connection(&mut self, addr: &str, platform_user_id: PlayerId) -> u64 {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.connections.insert(
            conn_id,
            ServerConn::new(conn_id, addr.to_owned(), platform_user_id),
        );
        info!(addr, conn = conn_id, "incoming connection");
        conn_id
    }

    /// Call when a client disconnects.
    pub fn connection_closed(&mut self, conn_id: u64) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };

        if let (Some(game_name), Some(game_conn)) = (&conn.game_name, conn.game_conn_id) {
            if let Some(game) = self.games.get(game_name) {
                game.client_left_game(game_conn);
            }
            let update = self.game_update_info(game_name);
            if let Some((np, no, status)) = update {
                let name = game_name.clone();
                self.broadcast_update_game(&name, np, no, status);
            }
        }

        if conn.connection_accepted {
            for other in self.connections.values_mut() {
                let mut buf = OutputByteBuf::new(&mut other.output_data);
                buf.write_ubyte(server_msg::PLAYER_DISCONNECTED);
                buf.write_string(conn.player_id.as_str());
            }
        }

        info!(
            addr = %conn.addr,
            player = %conn.player_id,
            "player disconnected"
        );
    }

    /// Collects the bytes waiting to be sent to one client. Respects the
    /// password back-off window.
    pub fn get_output_data(&mut self, conn_id: u64) -> Vec<u8> {
        let now = self.clock.now_ms();
        let game_data = {
            let Some(conn) = self.connections.get(&conn_id) else {
                return Vec::new();
            };
            if conn.wait_until.is_some_and(|t| now < t) {
                return Vec::new();
            }
            match (&conn.game_name, conn.game_conn_id) {
                (Some(name), Some(game_conn)) => self
                    .games
                    .get(name)
                    .map(|game| game.get_output_data(game_conn)),
                _ => None,
            }
        };
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return Vec::new();
        };
        conn.wait_until = None;
        if let Some(bytes) = game_data {
            if conn.output_data.is_empty() {
                conn.output_data = bytes;
            } else {
                conn.output_data.extend_from_slice(&bytes);
            }
        }
        std::mem::take(&mut conn.output_data)
    }

    /// Connections flagged for closing after a protocol error. The owner
    /// flushes their output, closes the socket, then calls
    /// [`connection_closed`](Self::connection_closed).
    pub fn take_connections_to_close(&mut self) -> Vec<u64> {
        self.connections
            .iter()
            .filter(|(_, c)| c.close_scheduled)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn set_ping_time(&mut self, conn_id: u64, ping_ms: u32) {
        if let Some(conn) = self.connections.get(&conn_id) {
            if let (Some(name), Some(game_conn)) = (&conn.game_name, conn.game_conn_id) {
                if let Some(game) = self.games.get(name) {
                    game.set_ping_time(game_conn, ping_ms);
                }
            }
        }
    }

    // -- input decoding -----------------------------------------------------

    /// Decodes a packet of client messages, routing each into the
    /// connection's session as appropriate. Malformed input earns the
    /// sender a `ServerError` and schedules the connection for closing.
    pub fn receive_input_data(&mut self, conn_id: u64, data: &[u8]) {
        if !self.connections.contains_key(&conn_id) {
            return;
        }

        if let Err(err) = self.rate_limit(conn_id, data.len() as u32) {
            self.protocol_failure(conn_id, err);
            return;
        }

        let result = self.decode_messages(conn_id, data);

        if let Some(conn) = self.connections.get(&conn_id) {
            if let (Some(name), Some(_)) = (&conn.game_name, conn.game_conn_id) {
                if let Some(game) = self.games.get(name) {
                    game.end_of_message_packet();
                }
            }
        }

        if let Err(err) = result {
            self.protocol_failure(conn_id, err);
        }
    }

    fn rate_limit(&mut self, conn_id: u64, nbytes: u32) -> Result<(), ProtocolError> {
        let now = self.clock.now_ms();
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return Ok(());
        };
        if now.saturating_sub(conn.rate_window_start) >= RATE_LIMIT_WINDOW_MS {
            conn.rate_window_start = now;
            conn.rate_bytes = 0;
        }
        conn.rate_bytes = conn.rate_bytes.saturating_add(nbytes);
        if conn.rate_bytes > RATE_LIMIT_BYTES {
            return Err(ProtocolError::key("too_much_data"));
        }
        Ok(())
    }

    /// A protocol error: clear any half-written output, send the error,
    /// and schedule the connection for closing. Other connections are
    /// never affected.
    fn protocol_failure(&mut self, conn_id: u64, err: ProtocolError) {
        let key = err.local_key();
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.output_data.clear();
            if !conn.error_sent {
                write_server_error(conn, &key);
            }
            conn.close_scheduled = true;
            warn!(conn = conn.unique_id, player = %conn.player_id, error = %key, "protocol error");
        }
    }

    fn decode_messages(&mut self, conn_id: u64, data: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = InputByteBuf::new(data);

        while !buf.eof() {
            // The first thing a client sends is its version string,
            // e.g. "Knights/018".
            if !self.conn(conn_id)?.version_string_received {
                self.handle_version_string(conn_id, &mut buf)?;
                continue;
            }

            let msg = buf.read_ubyte()?;

            // Until the player id (and password) are accepted, only those
            // two messages are allowed.
            if !self.conn(conn_id)?.connection_accepted
                && msg != client_msg::SET_PLAYER_ID
                && msg != client_msg::SEND_PASSWORD
            {
                if self.conn(conn_id)?.error_sent {
                    return Ok(());
                }
                return Err(ProtocolError::key("access_denied"));
            }

            match msg {
                client_msg::SET_PLAYER_ID => self.handle_set_player_id(conn_id, &mut buf)?,
                client_msg::SEND_PASSWORD => self.handle_send_password(conn_id, &mut buf)?,
                client_msg::JOIN_GAME | client_msg::JOIN_GAME_SPLIT_SCREEN => {
                    let split = msg == client_msg::JOIN_GAME_SPLIT_SCREEN;
                    let game_name = buf.read_string()?;
                    self.handle_join_game(conn_id, &game_name, split);
                }
                client_msg::LEAVE_GAME => self.handle_leave_game(conn_id),
                client_msg::CHAT => {
                    let text = buf.read_string()?;
                    self.handle_chat(conn_id, &text);
                }
                client_msg::SET_READY => {
                    let ready = buf.read_ubyte()? != 0;
                    self.with_game_status_watch(conn_id, |game, game_conn| {
                        game.set_ready(game_conn, ready)
                    });
                }
                client_msg::SET_HOUSE_COLOUR => {
                    let colour = buf.read_ubyte()?;
                    self.with_game(conn_id, |game, game_conn| {
                        game.set_house_colour(game_conn, colour)
                    });
                }
                client_msg::SET_MENU_SELECTION => {
                    let item = buf.read_var_int()?;
                    let choice = buf.read_var_int()?;
                    self.with_game(conn_id, |game, game_conn| {
                        game.set_menu_selection(game_conn, item, choice)
                    });
                }
                client_msg::FINISHED_LOADING => {
                    self.with_game(conn_id, |game, game_conn| game.finished_loading(game_conn));
                }
                client_msg::SEND_CONTROL => {
                    let control = ControlByte::decode(buf.read_ubyte()?);
                    if control.control_num == 0 {
                        return Err(ProtocolError::key("bad_control_num"));
                    }
                    self.with_game(conn_id, |game, game_conn| {
                        game.send_control(game_conn, control.player_slot, control.control_num)
                    });
                }
                client_msg::READY_TO_END => {
                    self.with_game_status_watch(conn_id, |game, game_conn| {
                        game.ready_to_end(game_conn)
                    });
                }
                client_msg::SET_PAUSE_MODE => {
                    let paused = buf.read_ubyte()? != 0;
                    self.with_game(conn_id, |game, _| game.set_pause_mode(paused));
                }
                client_msg::SET_OBS_FLAG => {
                    let obs = buf.read_ubyte()? != 0;
                    self.handle_set_obs_flag(conn_id, obs);
                }
                client_msg::REQUEST_SPEECH_BUBBLE => {
                    let show = buf.read_ubyte()? != 0;
                    self.with_game(conn_id, |game, game_conn| {
                        game.request_speech_bubble(game_conn, show)
                    });
                }
                client_msg::SET_APPROACH_BASED_CONTROLS => {
                    let flag = buf.read_ubyte()? != 0;
                    self.conn_mut(conn_id)?.approach_based_controls = flag;
                }
                client_msg::SET_ACTION_BAR_CONTROLS => {
                    let flag = buf.read_ubyte()? != 0;
                    self.conn_mut(conn_id)?.action_bar_controls = flag;
                }
                client_msg::RANDOM_QUEST => {
                    self.with_game(conn_id, |game, game_conn| game.random_quest(game_conn));
                }
                _ => return Err(ProtocolError::key("unknown_client_message")),
            }
        }

        Ok(())
    }

    fn conn(&self, conn_id: u64) -> Result<&ServerConn, ProtocolError> {
        self.connections
            .get(&conn_id)
            .ok_or(ProtocolError::UnexpectedEnd)
    }

    fn conn_mut(&mut self, conn_id: u64) -> Result<&mut ServerConn, ProtocolError> {
        self.connections
            .get_mut(&conn_id)
            .ok_or(ProtocolError::UnexpectedEnd)
    }

    fn handle_version_string(
        &mut self,
        conn_id: u64,
        buf: &mut InputByteBuf<'_>,
    ) -> Result<(), ProtocolError> {
        let version_string = buf.read_string()?;
        let Some(digits) = version_string.strip_prefix(VERSION_STRING_PREFIX) else {
            return Err(ProtocolError::key("invalid_connection_string"));
        };
        let version: u32 = digits
            .trim()
            .parse()
            .map_err(|_| ProtocolError::key("invalid_connection_string"))?;

        if version < COMPATIBLE_VERSION {
            return Err(ProtocolError::key("old_knights_version"));
        }
        if version > PROTOCOL_VERSION {
            return Err(ProtocolError::key("old_server"));
        }

        let motd = if version < PROTOCOL_VERSION {
            self.old_motd.clone().or_else(|| self.motd.clone())
        } else {
            self.motd.clone()
        };

        let conn = self.conn_mut(conn_id)?;
        conn.client_version = version;
        conn.version_string_received = true;

        if let Some(motd) = motd {
            let mut out = OutputByteBuf::new(&mut conn.output_data);
            out.write_ubyte(server_msg::ANNOUNCEMENT_LOC);
            write_local_msg(
                &mut out,
                &LocalMsg::with_params(
                    "motd",
                    vec![knights_protocol::LocalParam::Text(motd)],
                ),
            );
        }
        Ok(())
    }

    fn handle_set_player_id(
        &mut self,
        conn_id: u64,
        buf: &mut InputByteBuf<'_>,
    ) -> Result<(), ProtocolError> {
        let new_id = PlayerId::new(buf.read_string()?);

        let id_taken = self
            .connections
            .iter()
            .any(|(id, c)| *id != conn_id && c.player_id == new_id);

        let conn = self.conn_mut(conn_id)?;
        if !conn.player_id.is_empty() {
            write_server_error(conn, &LocalKey::new("player_id_already_set"));
        } else if !conn.platform_user_id.is_empty() && new_id != conn.platform_user_id {
            write_server_error(conn, &LocalKey::new("player_id_mismatch"));
        } else if new_id.is_empty() {
            write_server_error(conn, &LocalKey::new("player_id_is_empty"));
        } else if id_taken {
            write_server_error(conn, &LocalKey::new("already_connected"));
        } else {
            conn.player_id = new_id.clone();
            info!(addr = %conn.addr, player = %new_id, "player connected");

            if self.password.is_some() {
                let conn = self.conn_mut(conn_id)?;
                let mut out = OutputByteBuf::new(&mut conn.output_data);
                out.write_ubyte(server_msg::REQUEST_PASSWORD);
                out.write_ubyte(1); // first attempt
            } else {
                self.send_startup_messages(conn_id);
            }
        }
        Ok(())
    }

    fn handle_send_password(
        &mut self,
        conn_id: u64,
        buf: &mut InputByteBuf<'_>,
    ) -> Result<(), ProtocolError> {
        let their_password = buf.read_string()?;
        let now = self.clock.now_ms();
        let password_ok = self
            .password
            .as_deref()
            .map_or(true, |p| p == their_password);

        {
            let conn = self.conn(conn_id)?;
            if conn.player_id.is_empty() {
                return Err(ProtocolError::key("must_set_id"));
            }
            if conn.failed_password_attempts >= MAX_PASSWORD_ATTEMPTS {
                return Err(ProtocolError::key("password_incorrect"));
            }
        }

        if password_ok {
            let player = self.conn(conn_id)?.player_id.clone();
            info!(player = %player, "password accepted");
            self.send_startup_messages(conn_id);
        } else {
            let conn = self.conn_mut(conn_id)?;
            conn.failed_password_attempts += 1;
            // make them wait a couple of seconds between attempts
            conn.wait_until = Some(now + PASSWORD_RETRY_DELAY_MS);
            let player = conn.player_id.clone();
            let mut out = OutputByteBuf::new(&mut conn.output_data);
            out.write_ubyte(server_msg::REQUEST_PASSWORD);
            out.write_ubyte(0);
            info!(player = %player, "password rejected");
        }
        Ok(())
    }

    /// Accepted: send the player list, the game directory, then
    /// `ConnectionAccepted`; tell everyone else about the newcomer.
    fn send_startup_messages(&mut self, conn_id: u64) {
        struct PlayerRow {
            id: PlayerId,
            game: String,
            obs: bool,
        }
        let rows: Vec<PlayerRow> = self
            .connections
            .iter()
            .filter(|(id, c)| c.connection_accepted || **id == conn_id)
            .map(|(_, c)| PlayerRow {
                id: c.player_id.clone(),
                game: c.game_name.clone().unwrap_or_default(),
                obs: match (&c.game_name, c.game_conn_id) {
                    (Some(name), Some(gc)) => self
                        .games
                        .get(name)
                        .map(|g| g.obs_flag(gc))
                        .unwrap_or(false),
                    _ => false,
                },
            })
            .collect();

        let games: Vec<GameInfo> = self.running_games();

        let new_player_id = {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return;
            };
            let mut out = OutputByteBuf::new(&mut conn.output_data);
            for row in &rows {
                out.write_ubyte(server_msg::UPDATE_PLAYER);
                out.write_string(row.id.as_str());
                out.write_string(&row.game);
                out.write_ubyte(row.obs as u8);
            }
            for game in &games {
                out.write_ubyte(server_msg::UPDATE_GAME);
                out.write_string(&game.game_name);
                out.write_var_int(game.num_players);
                out.write_var_int(game.num_observers);
                out.write_ubyte(game.status as u8);
            }
            out.write_ubyte(server_msg::CONNECTION_ACCEPTED);
            out.write_var_int(PROTOCOL_VERSION);
            conn.connection_accepted = true;
            conn.player_id.clone()
        };

        for (id, other) in self.connections.iter_mut() {
            if *id == conn_id {
                continue;
            }
            let mut out = OutputByteBuf::new(&mut other.output_data);
            out.write_ubyte(server_msg::PLAYER_CONNECTED);
            out.write_string(new_player_id.as_str());
        }
    }

    // -- routing helpers ----------------------------------------------------

    fn with_game(&mut self, conn_id: u64, f: impl FnOnce(&KnightsGame, u64)) {
        if let Some(conn) = self.connections.get(&conn_id) {
            if let (Some(name), Some(game_conn)) = (&conn.game_name, conn.game_conn_id) {
                if let Some(game) = self.games.get(name) {
                    f(game, game_conn);
                }
            }
        }
    }

    /// Like [`with_game`](Self::with_game), but broadcasts `UpdateGame`
    /// if the operation changed the game's status.
    fn with_game_status_watch(&mut self, conn_id: u64, f: impl FnOnce(&KnightsGame, u64)) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let (Some(name), Some(game_conn)) = (conn.game_name.clone(), conn.game_conn_id) else {
            return;
        };
        let Some(game) = self.games.get(&name) else {
            return;
        };
        let old_status = game.status();
        f(game, game_conn);
        let new_status = game.status();
        if new_status != old_status {
            let np = game.num_players();
            let no = game.num_observers();
            self.broadcast_update_game(&name, np, no, new_status);
        }
    }

    fn handle_join_game(&mut self, conn_id: u64, game_name: &str, split_screen: bool) {
        let deny = |conn: &mut ServerConn, key: &str| {
            let mut out = OutputByteBuf::new(&mut conn.output_data);
            out.write_ubyte(server_msg::JOIN_GAME_DENIED);
            out.write_string(key);
        };

        let already_in_game = self
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.in_game());
        let player_id = self
            .connections
            .get(&conn_id)
            .map(|c| c.player_id.clone())
            .unwrap_or_default();

        let Some(game) = self.games.get(game_name) else {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                deny(conn, "game_not_found");
            }
            return;
        };

        if already_in_game {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                deny(conn, "already_in_game");
            }
            return;
        }
        if split_screen && !game.is_split_screen_allowed() {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                deny(conn, "split_screen_not_allowed");
            }
            return;
        }
        if split_screen && (game.num_players() > 0 || game.num_observers() > 0) {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                deny(conn, "split_screen_too_many");
            }
            return;
        }

        let (id1, id2) = if split_screen {
            (PlayerId::new("Player 1"), PlayerId::new("Player 2"))
        } else {
            (player_id.clone(), PlayerId::default())
        };

        let (version, approach, action_bar) = {
            let Some(conn) = self.connections.get(&conn_id) else {
                return;
            };
            (
                conn.client_version,
                conn.approach_based_controls,
                conn.action_bar_controls,
            )
        };

        match game.new_client_connection(id1.clone(), id2, version, approach, action_bar) {
            Ok(game_conn) => {
                let obs = game.obs_flag(game_conn);
                let np = game.num_players();
                let no = game.num_observers();
                let status = game.status();

                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.game_name = Some(game_name.to_owned());
                    conn.game_conn_id = Some(game_conn);
                }

                for other in self.connections.values_mut() {
                    let mut out = OutputByteBuf::new(&mut other.output_data);
                    out.write_ubyte(server_msg::UPDATE_PLAYER);
                    out.write_string(id1.as_str());
                    out.write_string(game_name);
                    out.write_ubyte(obs as u8);
                }
                self.broadcast_update_game(game_name, np, no, status);
            }
            Err(SessionError::JoinDenied(key)) => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    deny(conn, key.as_str());
                }
            }
            Err(err) => {
                warn!(game = game_name, error = %err, "join failed");
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    deny(conn, "unknown_error");
                }
            }
        }
    }

    fn handle_leave_game(&mut self, conn_id: u64) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let (Some(game_name), Some(game_conn)) = (conn.game_name.take(), conn.game_conn_id.take())
        else {
            return;
        };
        let player_id = conn.player_id.clone();

        // read any pending data from the game before dropping the link
        if let Some(game) = self.games.get(&game_name) {
            let pending = game.get_output_data(game_conn);
            conn.output_data.extend_from_slice(&pending);
            conn.output_data.push(server_msg::LEAVE_GAME);
            game.client_left_game(game_conn);
        }

        for other in self.connections.values_mut() {
            let mut out = OutputByteBuf::new(&mut other.output_data);
            out.write_ubyte(server_msg::UPDATE_PLAYER);
            out.write_string(player_id.as_str());
            out.write_string(""); // no game
            out.write_ubyte(0);
        }

        if let Some((np, no, status)) = self.game_update_info(&game_name) {
            self.broadcast_update_game(&game_name, np, no, status);
        }
    }

    fn handle_chat(&mut self, conn_id: u64, text: &str) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let player_id = conn.player_id.clone();

        if let (Some(name), Some(game_conn)) = (&conn.game_name, conn.game_conn_id) {
            if let Some(game) = self.games.get(name) {
                game.send_chat_message(game_conn, text);
            }
        } else {
            // lobby chat goes to everybody who is not in a game
            for other in self.connections.values_mut() {
                if other.in_game() {
                    continue;
                }
                let mut out = OutputByteBuf::new(&mut other.output_data);
                out.write_ubyte(server_msg::CHAT);
                out.write_string(player_id.as_str());
                out.write_ubyte(ChatKind::Lobby as u8);
                out.write_string(text);
            }
        }
        info!(player = %player_id, "chat");
    }

    fn handle_set_obs_flag(&mut self, conn_id: u64, requested: bool) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let (Some(name), Some(game_conn)) = (conn.game_name.clone(), conn.game_conn_id) else {
            return;
        };
        let player_id = conn.player_id.clone();
        let Some(game) = self.games.get(&name) else {
            return;
        };

        let old_flag = game.obs_flag(game_conn);
        if requested == old_flag {
            return;
        }
        game.set_obs_flag(game_conn, requested);
        let new_flag = game.obs_flag(game_conn);
        if new_flag != requested {
            return; // the game refused (e.g. quest already running)
        }

        let np = game.num_players();
        let no = game.num_observers();
        let status = game.status();
        for other in self.connections.values_mut() {
            let mut out = OutputByteBuf::new(&mut other.output_data);
            out.write_ubyte(server_msg::UPDATE_PLAYER);
            out.write_string(player_id.as_str());
            out.write_string(&name);
            out.write_ubyte(new_flag as u8);
        }
        self.broadcast_update_game(&name, np, no, status);
    }

    // -- game directory -----------------------------------------------------

    /// Starts a new, empty game from a loaded configuration.
    pub fn start_new_game(
        &mut self,
        config: GameConfig,
        game_name: &str,
    ) -> Result<(), ServerError> {
        if game_name.is_empty() {
            return Err(ServerError::EmptyGameName);
        }
        if self.games.contains_key(game_name) {
            return Err(ServerError::DuplicateGameName(game_name.to_owned()));
        }

        self.game_seed_counter += 1;
        let seed = self.rng_seed ^ self.game_seed_counter.wrapping_mul(0xA076_1D64_78BD_642F);
        let game = KnightsGame::new(
            config,
            Arc::clone(&self.clock),
            self.allow_split_screen,
            game_name.to_owned(),
            self.worker_mode,
            seed,
        );
        let np = game.num_players();
        let no = game.num_observers();
        let status = game.status();
        self.games.insert(game_name.to_owned(), game);
        self.broadcast_update_game(game_name, np, no, status);
        info!(game = game_name, "game created");
        Ok(())
    }

    /// Destroys an empty game. Fails (returns false) if anyone is still
    /// connected to it.
    pub fn close_game(&mut self, game_name: &str) -> bool {
        let empty = self
            .games
            .get(game_name)
            .is_some_and(|g| g.num_players() == 0 && g.num_observers() == 0);
        if !empty {
            return false;
        }
        if let Some(game) = self.games.remove(game_name) {
            game.shutdown();
        }
        for other in self.connections.values_mut() {
            let mut out = OutputByteBuf::new(&mut other.output_data);
            out.write_ubyte(server_msg::DROP_GAME);
            out.write_string(game_name);
        }
        info!(game = game_name, "game closed");
        true
    }

    pub fn running_games(&self) -> Vec<GameInfo> {
        self.games
            .iter()
            .map(|(name, game)| GameInfo {
                game_name: name.clone(),
                num_players: game.num_players(),
                num_observers: game.num_observers(),
                status: game.status(),
            })
            .collect()
    }

    pub fn num_players(&self) -> usize {
        self.connections.len()
    }

    fn game_update_info(&self, game_name: &str) -> Option<(u32, u32, GameStatus)> {
        self.games
            .get(game_name)
            .map(|g| (g.num_players(), g.num_observers(), g.status()))
    }

    fn broadcast_update_game(&mut self, name: &str, np: u32, no: u32, status: GameStatus) {
        for conn in self.connections.values_mut() {
            let mut out = OutputByteBuf::new(&mut conn.output_data);
            out.write_ubyte(server_msg::UPDATE_GAME);
            out.write_string(name);
            out.write_var_int(np);
            out.write_var_int(no);
            out.write_ubyte(status as u8);
        }
    }

    // -- maintenance --------------------------------------------------------

    /// Sweeps sessions whose engine failed fatally: members get their
    /// remaining output plus the error, and the session is destroyed. The
    /// rest of the server keeps running.
    pub fn poll_sessions(&mut self) {
        let failed: Vec<String> = self
            .games
            .iter()
            .filter_map(|(name, game)| game.take_fatal_error().map(|err| (name.clone(), err)))
            .map(|(name, err)| {
                warn!(game = %name, error = %err, "session failed; destroying");
                name
            })
            .collect();

        for name in failed {
            // pull remaining output (the session already wrote its error
            // message to every member) and detach members
            let member_ids: Vec<u64> = self
                .connections
                .iter()
                .filter(|(_, c)| c.game_name.as_deref() == Some(name.as_str()))
                .map(|(id, _)| *id)
                .collect();
            for conn_id in member_ids {
                let game_conn = self
                    .connections
                    .get(&conn_id)
                    .and_then(|c| c.game_conn_id);
                if let (Some(game), Some(game_conn)) = (self.games.get(&name), game_conn) {
                    let pending = game.get_output_data(game_conn);
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        conn.output_data.extend_from_slice(&pending);
                        conn.output_data.push(server_msg::LEAVE_GAME);
                        conn.game_name = None;
                        conn.game_conn_id = None;
                    }
                }
            }
            if let Some(game) = self.games.remove(&name) {
                game.shutdown();
            }
            for conn in self.connections.values_mut() {
                let mut out = OutputByteBuf::new(&mut conn.output_data);
                out.write_ubyte(server_msg::DROP_GAME);
                out.write_string(&name);
            }
        }
    }

    /// Lifecycle cadence: closes empty games beyond the first, and (below
    /// `max_games`) creates a fresh one from the warm configuration.
    pub fn check_games(
        &mut self,
        max_games: usize,
        warm_config: &mut dyn FnMut() -> Option<GameConfig>,
    ) {
        let infos = self.running_games();

        let mut found_empty = false;
        for info in &infos {
            if info.num_players == 0 && info.num_observers == 0 {
                if !found_empty {
                    found_empty = true;
                } else {
                    self.close_game(&info.game_name);
                }
            }
        }

        if !found_empty && self.games.len() < max_games {
            if let Some(config) = warm_config() {
                let name = next_game_name(&infos);
                let _ = self.start_new_game(config, &name);
            }
        }
    }

    // -- replication support ------------------------------------------------

    /// Serializable copy of the whole server (connections and games).
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            allow_split_screen: self.allow_split_screen,
            motd: self.motd.clone(),
            old_motd: self.old_motd.clone(),
            password: self.password.clone(),
            connections: self.connections.values().cloned().collect(),
            games: self
                .games
                .iter()
                .map(|(name, game)| (name.clone(), game.snapshot()))
                .collect(),
            next_conn_id: self.next_conn_id,
            rng_seed: self.rng_seed,
            game_seed_counter: self.game_seed_counter,
        }
    }

    /// Rebuilds a server from a snapshot. `config_source` supplies a
    /// fresh `GameConfig` (from the local manifest) per game.
    pub fn restore(
        clock: Arc<dyn Clock>,
        worker_mode: WorkerMode,
        snap: ServerSnapshot,
        config_source: &dyn Fn() -> GameConfig,
    ) -> Result<Self, ServerError> {
        let mut server = KnightsServer::new(ServerParams {
            clock: Arc::clone(&clock),
            worker_mode,
            allow_split_screen: snap.allow_split_screen,
            motd: snap.motd,
            old_motd: snap.old_motd,
            password: snap.password,
            rng_seed: snap.rng_seed,
        });
        server.next_conn_id = snap.next_conn_id;
        server.game_seed_counter = snap.game_seed_counter;
        for conn in snap.connections {
            server.connections.insert(conn.unique_id, conn);
        }
        for (name, game_snap) in snap.games {
            let game = KnightsGame::from_snapshot(
                config_source(),
                Arc::clone(&clock),
                worker_mode,
                game_snap,
            )
            .map_err(|e| ServerError::BadSnapshot(e.to_string()))?;
            server.games.insert(name, game);
        }
        Ok(server)
    }

    /// Cooperative pump: runs every active game's worker one step.
    /// Returns the earliest next deadline across games.
    pub fn pump_games(&mut self, now_ms: u64) -> Option<u64> {
        let mut next: Option<u64> = None;
        for game in self.games.values() {
            if let Some(deadline) = game.pump(now_ms) {
                next = Some(next.map_or(deadline, |n: u64| n.min(deadline)));
            }
        }
        next
    }

    /// Shuts every session down and waits for their workers.
    pub fn shutdown(&mut self) {
        for (_, game) in std::mem::take(&mut self.games) {
            game.shutdown();
        }
    }
}

/// Serialized server state, as stored in replicated-VM snapshots.
#[derive(Serialize, Deserialize)]
pub struct ServerSnapshot {
    allow_split_screen: bool,
    motd: Option<String>,
    old_motd: Option<String>,
    password: Option<String>,
    connections: Vec<ServerConn>,
    games: Vec<(String, GameSnapshot)>,
    next_conn_id: u64,
    rng_seed: u64,
    game_seed_counter: u64,
}

fn write_server_error(conn: &mut ServerConn, key: &LocalKey) {
    let mut out = OutputByteBuf::new(&mut conn.output_data);
    out.write_ubyte(server_msg::ERROR);
    write_local_msg(&mut out, &LocalMsg::new(key.as_str()));
    conn.error_sent = true;
}

/// All auto-created games are named `Game N`; picks the lowest free N.
fn next_game_name(existing: &[GameInfo]) -> String {
    let taken: std::collections::BTreeSet<u32> = existing
        .iter()
        .filter_map(|info| {
            info.game_name
                .strip_prefix("Game ")
                .and_then(|n| n.parse().ok())
        })
        .collect();
    let mut n = 1;
    while taken.contains(&n) {
        n += 1;
    }
    format!("Game {n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_game_name_picks_lowest_free_number() {
        let infos = |names: &[&str]| -> Vec<GameInfo> {
            names
                .iter()
                .map(|n| GameInfo {
                    game_name: n.to_string(),
                    num_players: 0,
                    num_observers: 0,
                    status: GameStatus::WaitingForPlayers,
                })
                .collect()
        };
        assert_eq!(next_game_name(&infos(&[])), "Game 1");
        assert_eq!(next_game_name(&infos(&["Game 1", "Game 2"])), "Game 3");
        assert_eq!(next_game_name(&infos(&["Game 1", "Game 3"])), "Game 2");
        assert_eq!(next_game_name(&infos(&["other"])), "Game 1");
    }
}
