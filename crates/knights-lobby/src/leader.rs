//! The leader role: authoritative writer of the tick stream.
//!
//! The leader owns the VM, feeds it the local player's commands plus
//! everything followers send, and fans the resulting tick data out to
//! every follower: directly once they are synced, or via their sync
//! queue while a late-join transfer is still running.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use knights_engine::GameConfig;
use knights_protocol::{follower_msg, leader_msg, InputByteBuf, OutputByteBuf, PlayerId};
use knights_transport::PacketConn;
use knights_vm::{Checkpoint, KnightsVm, TickWriter, VM_SEED_LEN};

use crate::sync_host::SyncHost;
use crate::{LobbyError, LONG_FLUSH_DELAY_MS, MAX_FOLLOWERS, PING_UPDATE_INTERVAL_MS, SHORT_FLUSH_DELAY_MS};

struct FollowerSlot<C> {
    conn: Arc<C>,
    /// Present while the initial sync is still in progress.
    sync: Option<SyncHost>,
    ping_ms: u32,
}

/// Leader-side replication state.
pub struct LeaderState<C: PacketConn> {
    vm: KnightsVm,
    local_user_id: PlayerId,

    /// Indexed by client number; slot 0 is reserved for the local player
    /// and always empty.
    followers: Vec<Option<FollowerSlot<C>>>,
    incoming_tx: UnboundedSender<(u8, Option<Vec<u8>>)>,
    incoming_rx: UnboundedReceiver<(u8, Option<Vec<u8>>)>,

    /// Cached VM output addressed to the local player.
    local_player_packets: Vec<u8>,

    /// Finalized frames not yet flushed to followers.
    tick_data: Vec<u8>,
    writer: TickWriter,
    tick_data_contains_output: bool,
    /// Checkpoints covering the frames in `tick_data`, flushed with them.
    pending_checkpoints: VecDeque<Checkpoint>,

    started: Instant,
    last_tick_time_ms: u64,
    next_tick_deadline_ms: u64,
    last_flush_time_ms: u64,
    last_ping_update_ms: u64,
}

impl<C: PacketConn> LeaderState<C> {
    /// Boots a fresh VM (running an initial zero-length tick so
    /// everything loads) and connects the local player as client 0.
    pub fn new(
        local_user_id: PlayerId,
        seed: [u8; VM_SEED_LEN],
        config_source: Arc<dyn Fn() -> GameConfig + Send + Sync>,
    ) -> Result<Self, LobbyError> {
        let mut vm = KnightsVm::new(seed, config_source)?;
        let mut boot = Vec::new();
        TickWriter::new().finalize_into(&mut boot, 0)?;
        let sleep_ms = vm.run_ticks(&boot, None)?;
        Ok(Self::with_vm(local_user_id, vm, sleep_ms as u64))
    }

    /// Takes over an existing VM (host migration); the VM must have no
    /// active client connections.
    pub fn from_vm(local_user_id: PlayerId, vm: KnightsVm) -> Result<Self, LobbyError> {
        Ok(Self::with_vm(local_user_id, vm, 1))
    }

    fn with_vm(local_user_id: PlayerId, vm: KnightsVm, sleep_ms: u64) -> Self {
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let mut writer = TickWriter::new();
        // the local player connects as client number 0; the caller then
        // replays its join sequence through send_client_messages
        let _ = writer.write_new_connection(0, local_user_id.as_str());

        let mut state = LeaderState {
            vm,
            local_user_id,
            followers: Vec::new(),
            incoming_tx,
            incoming_rx,
            local_player_packets: Vec::new(),
            tick_data: Vec::new(),
            writer,
            tick_data_contains_output: false,
            pending_checkpoints: VecDeque::new(),
            started: Instant::now(),
            last_tick_time_ms: 0,
            next_tick_deadline_ms: 0,
            last_flush_time_ms: 0,
            last_ping_update_ms: 0,
        };
        let now = state.now_ms();
        state.last_tick_time_ms = now;
        state.next_tick_deadline_ms = now + sleep_ms;
        state.last_flush_time_ms = now;
        state.last_ping_update_ms = now;
        state
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn local_user_id(&self) -> &PlayerId {
        &self.local_user_id
    }

    // -- local player -------------------------------------------------------

    /// Queues the local player's commands for the next tick.
    pub fn send_client_messages(&mut self, data: &[u8]) -> Result<(), LobbyError> {
        if !data.is_empty() {
            self.writer.write_client_send_data(0, data)?;
        }
        Ok(())
    }

    /// Takes the game's output for the local player.
    pub fn receive_client_messages(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.local_player_packets)
    }

    // -- followers ----------------------------------------------------------

    fn client_num_in_use(&self, client_num: usize) -> bool {
        client_num == 0
            || self
                .followers
                .get(client_num)
                .is_some_and(|slot| slot.is_some())
    }

    /// Accepts a follower: assigns the lowest unused client number,
    /// sends it back as the very first byte, opens the VM connection and
    /// starts the memory sync. Refused over the follower cap.
    pub async fn add_follower(&mut self, conn: Arc<C>) -> Result<(), LobbyError> {
        let active = self.followers.iter().flatten().count();
        if active + 1 >= MAX_FOLLOWERS {
            let _ = conn.close().await;
            return Ok(());
        }

        let mut client_num = 0usize;
        while self.client_num_in_use(client_num) {
            client_num += 1;
        }

        conn.send(&[client_num as u8]).await?;
        self.writer
            .write_new_connection(client_num as u8, "")?;

        let (sync, config_msg) = SyncHost::new(&self.vm);
        conn.send(&config_msg).await?;

        // reader task: forwards packets (and the eventual close) to the
        // update loop
        let tx = self.incoming_tx.clone();
        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            loop {
                match reader_conn.recv().await {
                    Ok(Some(data)) => {
                        if tx.send((client_num as u8, Some(data))).is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = tx.send((client_num as u8, None));
                        break;
                    }
                }
            }
        });

        if self.followers.len() <= client_num {
            self.followers.resize_with(client_num + 1, || None);
        }
        self.followers[client_num] = Some(FollowerSlot {
            conn,
            sync: Some(sync),
            ping_ms: 0,
        });
        info!(client = client_num, "follower connected");
        Ok(())
    }

    /// Handles one inbound packet from a follower in steady state
    /// (after its sync finished).
    fn process_follower_packet(&mut self, client_num: u8, data: &[u8]) -> Result<(), LobbyError> {
        let mut buf = InputByteBuf::new(data);
        while !buf.eof() {
            match buf.read_ubyte()? {
                follower_msg::SEND_CLIENT_COMMANDS => {
                    let length = buf.read_var_int()? as usize;
                    if length < 1 || length > buf.remaining() {
                        return Err(LobbyError::Sync("invalid length"));
                    }
                    let bytes = buf.read_raw(length)?;
                    self.writer.write_client_send_data(client_num, bytes)?;
                }
                follower_msg::ACK_CATCHUP_TICKS => {
                    // late ack from a finished sync; nothing to retire
                    let _ = buf.read_var_int()?;
                }
                _ => return Err(LobbyError::Sync("invalid command byte")),
            }
        }
        Ok(())
    }

    fn drop_follower(&mut self, client_num: u8) {
        if let Some(slot) = self.followers.get_mut(client_num as usize) {
            if slot.take().is_some() {
                let _ = self.writer.write_close_connection(client_num);
                info!(client = client_num, "follower disconnected");
            }
        }
    }

    // -- update cycle -------------------------------------------------------

    /// One background-update cycle; call every few milliseconds.
    pub async fn update(&mut self) -> Result<(), LobbyError> {
        // 1. drain follower traffic
        while let Ok((client_num, maybe_data)) = self.incoming_rx.try_recv() {
            let Some(data) = maybe_data else {
                self.drop_follower(client_num);
                continue;
            };

            let in_sync = self
                .followers
                .get(client_num as usize)
                .and_then(|s| s.as_ref())
                .is_some_and(|s| s.sync.is_some());

            let result = if in_sync {
                self.process_sync_packet(client_num, &data).await
            } else {
                self.process_follower_packet(client_num, &data)
            };
            if let Err(err) = result {
                warn!(client = client_num, error = %err, "follower failed; dropping");
                self.drop_follower(client_num);
            }
        }

        let time_now = self.now_ms();

        // 2. run a VM tick when due, or early when input is pending
        if time_now >= self.next_tick_deadline_ms || self.writer.was_message_written() {
            // 3-second ping reports ride in the tick stream
            if time_now.saturating_sub(self.last_ping_update_ms) >= PING_UPDATE_INTERVAL_MS {
                for (num, slot) in self.followers.iter().enumerate() {
                    if let Some(slot) = slot {
                        self.writer
                            .write_client_ping_report(num as u8, slot.ping_ms.min(65535) as u16)?;
                    }
                }
                self.last_ping_update_ms = time_now;
            }

            let frame_start = self.tick_data.len();
            let writer = std::mem::take(&mut self.writer);
            writer.finalize_into(
                &mut self.tick_data,
                time_now.saturating_sub(self.last_tick_time_ms) as u32,
            )?;

            let mut vm_output = Vec::new();
            let sleep_ms = self
                .vm
                .run_ticks(&self.tick_data[frame_start..], Some(&mut vm_output))?;
            let had_output = self.route_vm_output(&vm_output)?;
            self.tick_data_contains_output |= had_output;
            self.pending_checkpoints.extend(self.vm.take_checkpoints());

            self.last_tick_time_ms = time_now;
            self.next_tick_deadline_ms = time_now + sleep_ms as u64;
        }

        // 3. flush tick data to followers so their VMs keep step
        let required_delay = if self.tick_data_contains_output {
            SHORT_FLUSH_DELAY_MS
        } else {
            LONG_FLUSH_DELAY_MS
        };
        if time_now.saturating_sub(self.last_flush_time_ms) > required_delay
            && !self.tick_data.is_empty()
        {
            self.flush_tick_data().await?;
            self.last_flush_time_ms = time_now;
        }

        Ok(())
    }

    async fn process_sync_packet(&mut self, client_num: u8, data: &[u8]) -> Result<(), LobbyError> {
        let Some(Some(slot)) = self.followers.get_mut(client_num as usize) else {
            return Ok(());
        };
        let Some(sync) = slot.sync.as_mut() else {
            return Ok(());
        };
        let mut replies = Vec::new();
        let done = sync.process_message(data, &mut replies)?;
        for reply in replies {
            slot.conn.send(&reply).await?;
        }
        if done {
            slot.sync = None;
            debug!(client = client_num, "sync complete");
        }
        Ok(())
    }

    async fn flush_tick_data(&mut self) -> Result<(), LobbyError> {
        let mut msg = Vec::with_capacity(self.tick_data.len() + 8);
        {
            let mut buf = OutputByteBuf::new(&mut msg);
            buf.write_ubyte(leader_msg::SEND_TICK_DATA);
            buf.write_var_int(self.tick_data.len() as u32);
            buf.write_raw(&self.tick_data);
        }

        let mut checksum_msgs = Vec::new();
        for cp in self.pending_checkpoints.drain(..) {
            let mut cp_msg = Vec::with_capacity(13);
            let mut buf = OutputByteBuf::new(&mut cp_msg);
            buf.write_ubyte(leader_msg::SEND_CHECKSUM);
            buf.write_u32(cp.timer_ms);
            buf.write_u64(cp.checksum);
            checksum_msgs.push(cp_msg);
        }

        for slot in self.followers.iter_mut().flatten() {
            match &mut slot.sync {
                Some(sync) => {
                    // still syncing: queue as catch-up ticks (checksums
                    // for this span are skipped; the follower aligns by
                    // VM time)
                    sync.add_catchup_ticks(&self.tick_data);
                }
                None => {
                    slot.conn.send(&msg).await?;
                    for cp_msg in &checksum_msgs {
                        slot.conn.send(cp_msg).await?;
                    }
                }
            }
        }

        self.tick_data.clear();
        self.tick_data_contains_output = false;
        Ok(())
    }

    /// Routes `ServerSendData` records from the VM output: data for
    /// client 0 is cached for the local player. Returns true if any data
    /// was addressed to anyone.
    fn route_vm_output(&mut self, vm_output: &[u8]) -> Result<bool, LobbyError> {
        struct Router<'a> {
            local: &'a mut Vec<u8>,
            any: bool,
        }
        impl knights_vm::TickSink for Router<'_> {
            fn on_server_send_data(
                &mut self,
                client: u8,
                data: &[u8],
            ) -> Result<(), knights_vm::VmError> {
                self.any = true;
                if client == 0 {
                    self.local.extend_from_slice(data);
                }
                Ok(())
            }
        }

        let mut router = Router {
            local: &mut self.local_player_packets,
            any: false,
        };
        knights_vm::read_all_ticks(vm_output, &mut router)?;
        Ok(router.any)
    }

    /// Extracts the VM for host migration, running a final tick that
    /// closes every connection. The leader is unusable afterwards.
    pub fn migrate(mut self) -> Result<KnightsVm, LobbyError> {
        let mut writer = std::mem::take(&mut self.writer);
        writer.write_close_all_connections()?;
        let mut final_tick = Vec::new();
        writer.finalize_into(&mut final_tick, 1)?;
        self.vm.run_ticks(&final_tick, None)?;
        Ok(self.vm)
    }
}
