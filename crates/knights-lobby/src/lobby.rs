//! Lobby containers.
//!
//! A lobby holds a Knights game and a local connection into it. The
//! local player pushes raw protocol bytes in and polls bytes out; where
//! those bytes go (an in-process server, or a replicated VM that may be
//! leader or follower today) is the container's business.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use knights_engine::GameConfig;
use knights_protocol::{ClientCommands, PlayerId};
use knights_server::KnightsServer;
use knights_transport::{ws_connect, PacketConn, WsConn, WsListener};
use knights_vm::{VM_GAME_NAME, VM_SEED_LEN};

use crate::follower::FollowerState;
use crate::leader::LeaderState;
use crate::LobbyError;

/// A container for a Knights game, seen from the local player's side.
pub trait KnightsLobby {
    /// Sends protocol bytes from the local player into the game.
    fn send_client_bytes(&mut self, data: &[u8]);

    /// Takes protocol bytes from the game to the local player.
    fn poll_client_bytes(&mut self) -> Vec<u8>;

    /// Number of players known to be connected (0 when unknown).
    fn num_players(&self) -> usize;
}

// ---------------------------------------------------------------------------
// SimpleLobby
// ---------------------------------------------------------------------------

/// A locally hosted, non-replicated game: an in-process server plus one
/// local connection. The network-facing variant of this is the server
/// binary; this container serves local play and tests.
pub struct SimpleLobby {
    server: KnightsServer,
    local_conn: u64,
}

impl SimpleLobby {
    pub fn new(mut server: KnightsServer, game_name: &str, config: GameConfig) -> Self {
        // an error here means the caller passed a duplicate name
        if let Err(err) = server.start_new_game(config, game_name) {
            warn!(error = %err, "could not create lobby game");
        }
        let local_conn = server.new_client_connection("", PlayerId::default());
        SimpleLobby { server, local_conn }
    }

    pub fn server(&mut self) -> &mut KnightsServer {
        &mut self.server
    }
}

impl KnightsLobby for SimpleLobby {
    fn send_client_bytes(&mut self, data: &[u8]) {
        self.server.receive_input_data(self.local_conn, data);
    }

    fn poll_client_bytes(&mut self) -> Vec<u8> {
        self.server.poll_sessions();
        self.server.get_output_data(self.local_conn)
    }

    fn num_players(&self) -> usize {
        self.server.num_players()
    }
}

// ---------------------------------------------------------------------------
// Platform lobby boundary
// ---------------------------------------------------------------------------

/// State of the external platform lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    /// Members still gathering.
    Waiting,
    /// The lobby is live; a leader is elected.
    Active,
    /// The lobby is gone.
    Closed,
}

/// The external leader-election service (platform matchmaking, etc.).
/// The replication layer never elects leaders itself; it only follows
/// what this interface reports.
pub trait PlatformLobby: Send + Sync {
    fn state(&self) -> LobbyState;
    fn current_leader_id(&self) -> PlayerId;
    /// Address of the current leader, e.g. `ws://host:port/`, for peers
    /// that need to connect to it.
    fn leader_address(&self) -> String;
}

// ---------------------------------------------------------------------------
// VmLobby
// ---------------------------------------------------------------------------

enum Role {
    Leader(LeaderState<WsConn>),
    Follower(FollowerState<WsConn>),
}

struct VmShared {
    role: Mutex<Option<Role>>,
    local_in: StdMutex<Vec<u8>>,
    local_out: StdMutex<Vec<u8>>,
    last_error: StdMutex<Option<LobbyError>>,
}

/// The host-migratable lobby: a replicated deterministic VM, led by
/// whichever peer the platform lobby currently designates.
///
/// Created as leader (with no listening port yet); [`become_leader`] /
/// [`become_follower`] switch roles, carrying the VM across so the game
/// survives the handover.
///
/// [`become_leader`]: VmLobby::become_leader
/// [`become_follower`]: VmLobby::become_follower
pub struct VmLobby {
    shared: Arc<VmShared>,
    local_user_id: PlayerId,
    driver: JoinHandle<()>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl VmLobby {
    /// Boots the VM and becomes leader (without a listening port). Must
    /// be called within a tokio runtime.
    pub fn new(
        local_user_id: PlayerId,
        seed: [u8; VM_SEED_LEN],
        config_source: Arc<dyn Fn() -> GameConfig + Send + Sync>,
    ) -> Result<Self, LobbyError> {
        let leader = LeaderState::new(local_user_id.clone(), seed, config_source)?;
        let shared = Arc::new(VmShared {
            role: Mutex::new(Some(Role::Leader(leader))),
            local_in: StdMutex::new(Vec::new()),
            local_out: StdMutex::new(Vec::new()),
            last_error: StdMutex::new(None),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = tokio::spawn(async move {
            drive(driver_shared).await;
        });

        let lobby = VmLobby {
            shared,
            local_user_id,
            driver,
            accept_task: StdMutex::new(None),
        };
        lobby.rejoin_game();
        Ok(lobby)
    }

    /// An error raised by the background driver (desync, lost leader,
    /// ...). The owner reacts by re-syncing or leaving the lobby.
    pub fn take_error(&self) -> Option<LobbyError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn queue_error(shared: &VmShared, err: LobbyError) {
        let mut slot = shared.last_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Queues the local player's join sequence, replayed whenever this
    /// peer (re)enters the running game.
    fn rejoin_game(&self) {
        let mut client = ClientCommands::new();
        client.send_version();
        client.set_player_id(&self.local_user_id);
        client.join_game(VM_GAME_NAME);
        self.shared
            .local_in
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(&client.take_output());
    }

    /// Promotes this peer to leader: the follower connection is closed,
    /// the VM is extracted and a leader instance starts listening for
    /// followers. A no-op when already leading (beyond opening the
    /// listener).
    pub async fn become_leader(&self, listener: WsListener) -> Result<(), LobbyError> {
        let mut need_rejoin = false;
        {
            let mut role = self.shared.role.lock().await;
            match role.take() {
                Some(Role::Follower(follower)) => {
                    let _ = follower.conn().close().await;
                    let vm = follower.migrate()?;
                    *role = Some(Role::Leader(LeaderState::from_vm(
                        self.local_user_id.clone(),
                        vm,
                    )?));
                    need_rejoin = true;
                    info!("promoted to leader");
                }
                other => *role = other,
            }
        }

        // accept loop feeding new followers to the leader
        let shared = Arc::clone(&self.shared);
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let mut role = shared.role.lock().await;
                        if let Some(Role::Leader(leader)) = role.as_mut() {
                            if let Err(err) = leader.add_follower(conn).await {
                                VmLobby::queue_error(&shared, err);
                            }
                        }
                        // conn is dropped if we stopped leading meanwhile
                    }
                    Err(_) => break,
                }
            }
        });
        let old = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(accept);
        if let Some(old) = old {
            old.abort();
        }

        if need_rejoin {
            self.rejoin_game();
        }
        Ok(())
    }

    /// Demotes this peer to follower of the leader at `url`: the
    /// listener closes, the VM is extracted and reconnected under the
    /// new leader, and the local player re-joins the game.
    pub async fn become_follower(&self, url: &str) -> Result<(), LobbyError> {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        {
            let mut role = self.shared.role.lock().await;
            let vm = match role.take() {
                Some(Role::Leader(leader)) => leader.migrate()?,
                Some(Role::Follower(follower)) => {
                    let _ = follower.conn().close().await;
                    follower.migrate()?
                }
                None => return Err(LobbyError::Sync("lobby has no role")),
            };
            let conn = ws_connect(url).await?;
            *role = Some(Role::Follower(FollowerState::new(vm, conn)));
            info!(url, "demoted to follower");
        }

        self.rejoin_game();
        Ok(())
    }
}

impl Drop for VmLobby {
    fn drop(&mut self) {
        self.driver.abort();
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl KnightsLobby for VmLobby {
    fn send_client_bytes(&mut self, data: &[u8]) {
        self.shared
            .local_in
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
    }

    fn poll_client_bytes(&mut self) -> Vec<u8> {
        std::mem::take(
            &mut self
                .shared
                .local_out
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    fn num_players(&self) -> usize {
        // the directory lives inside the VM; the client learns it from
        // UpdateGame messages instead
        0
    }
}

/// Background driver: pushes local input into the current role, runs its
/// update cycle, and pulls local output back out.
async fn drive(shared: Arc<VmShared>) {
    loop {
        {
            let mut role_guard = shared.role.lock().await;
            let Some(role) = role_guard.as_mut() else {
                drop(role_guard);
                tokio::time::sleep(Duration::from_millis(3)).await;
                continue;
            };

            let pending = std::mem::take(
                &mut *shared.local_in.lock().unwrap_or_else(|e| e.into_inner()),
            );

            let result = match role {
                Role::Leader(leader) => {
                    let r = if pending.is_empty() {
                        Ok(())
                    } else {
                        leader.send_client_messages(&pending)
                    };
                    match r {
                        Ok(()) => leader.update().await,
                        Err(e) => Err(e),
                    }
                    .map(|()| leader.receive_client_messages())
                }
                Role::Follower(follower) => {
                    let mut r = if pending.is_empty() {
                        Ok(())
                    } else {
                        follower.send_client_messages(&pending).await
                    };
                    if r.is_ok() {
                        // wait briefly for leader traffic
                        let conn = Arc::clone(follower.conn());
                        match tokio::time::timeout(Duration::from_millis(3), conn.recv()).await {
                            Ok(Ok(Some(data))) => r = follower.handle_packet(&data).await,
                            Ok(Ok(None)) => r = Err(LobbyError::Sync("leader disconnected")),
                            Ok(Err(err)) => r = Err(err.into()),
                            Err(_) => {} // timeout: no traffic this cycle
                        }
                    }
                    r.map(|()| follower.receive_client_messages())
                }
            };

            match result {
                Ok(bytes) => {
                    if !bytes.is_empty() {
                        shared
                            .local_out
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend_from_slice(&bytes);
                    }
                }
                Err(err) => VmLobby::queue_error(&shared, err),
            }
        }

        tokio::time::sleep(Duration::from_millis(3)).await;
    }
}

// ---------------------------------------------------------------------------
// LobbyController
// ---------------------------------------------------------------------------

/// Watches the platform lobby and switches the local peer's role to
/// match the reported leader.
pub struct LobbyController {
    lobby: VmLobby,
    platform: Arc<dyn PlatformLobby>,
    listen_addr: String,
    /// Leader id acted on most recently.
    applied_leader: Option<PlayerId>,
}

impl LobbyController {
    pub fn new(lobby: VmLobby, platform: Arc<dyn PlatformLobby>, listen_addr: String) -> Self {
        LobbyController {
            lobby,
            platform,
            listen_addr,
            applied_leader: None,
        }
    }

    pub fn lobby(&mut self) -> &mut VmLobby {
        &mut self.lobby
    }

    /// Applies the platform's current leader choice: promote, demote or
    /// reconnect as needed. Call on a regular cadence.
    pub async fn poll(&mut self) -> Result<(), LobbyError> {
        if self.platform.state() != LobbyState::Active {
            return Ok(());
        }
        let leader_id = self.platform.current_leader_id();
        if self.applied_leader.as_ref() == Some(&leader_id) {
            return Ok(());
        }

        if leader_id == *self.lobby.local_user_id() {
            let listener = WsListener::bind(&self.listen_addr).await?;
            self.lobby.become_leader(listener).await?;
        } else {
            let address = self.platform.leader_address();
            self.lobby.become_follower(&address).await?;
        }
        self.applied_leader = Some(leader_id);
        Ok(())
    }
}

impl VmLobby {
    pub fn local_user_id(&self) -> &PlayerId {
        &self.local_user_id
    }
}
