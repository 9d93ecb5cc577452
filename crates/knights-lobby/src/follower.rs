//! The follower role: replicates the leader's tick stream.
//!
//! The first byte from the leader is this peer's assigned client number.
//! After the initial sync, packets carry tick data (executed on the local
//! VM, with outputs filtered down to the local client) and leader
//! checksums, which are compared against locally produced ones: any
//! mismatch at the same VM time is a desync and fatal for this replica.
//! Outgoing local-player packets are held back until sync completes.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use knights_protocol::{follower_msg, leader_msg, InputByteBuf, OutputByteBuf};
use knights_transport::PacketConn;
use knights_vm::{Checkpoint, KnightsVm, TickWriter};

use crate::sync_client::SyncClient;
use crate::LobbyError;

/// Follower-side replication state.
pub struct FollowerState<C: PacketConn> {
    vm: KnightsVm,
    conn: Arc<C>,
    client_num: Option<u8>,
    sync: Option<SyncClient>,

    /// VM output addressed to the local player.
    local_player_packets: Vec<u8>,
    /// Local-player commands held back until the sync completes.
    delayed_packets: Vec<u8>,

    local_checkpoints: VecDeque<Checkpoint>,
    leader_checkpoints: VecDeque<Checkpoint>,
}

impl<C: PacketConn> FollowerState<C> {
    /// Wraps an existing VM (fresh-booted or extracted from a leader)
    /// and starts syncing against the given leader connection.
    pub fn new(vm: KnightsVm, conn: Arc<C>) -> Self {
        FollowerState {
            vm,
            conn,
            client_num: None,
            sync: Some(SyncClient::new()),
            local_player_packets: Vec::new(),
            delayed_packets: Vec::new(),
            local_checkpoints: VecDeque::new(),
            leader_checkpoints: VecDeque::new(),
        }
    }

    pub fn conn(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn client_num(&self) -> Option<u8> {
        self.client_num
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync.is_some()
    }

    // -- local player -------------------------------------------------------

    /// Sends the local player's commands to the leader (delayed while
    /// the initial sync runs).
    pub async fn send_client_messages(&mut self, data: &[u8]) -> Result<(), LobbyError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut msg = Vec::with_capacity(data.len() + 5);
        let mut buf = OutputByteBuf::new(&mut msg);
        buf.write_ubyte(follower_msg::SEND_CLIENT_COMMANDS);
        buf.write_var_int(data.len() as u32);
        buf.write_raw(data);

        if self.sync.is_some() {
            self.delayed_packets.extend_from_slice(&msg);
        } else {
            self.conn.send(&msg).await?;
        }
        Ok(())
    }

    /// Takes the game's output for the local player.
    pub fn receive_client_messages(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.local_player_packets)
    }

    // -- leader traffic -----------------------------------------------------

    /// Processes one packet from the leader. A decode failure here is
    /// unrecoverable: the follower can only disconnect and re-sync.
    pub async fn handle_packet(&mut self, mut data: &[u8]) -> Result<(), LobbyError> {
        // the very first byte is our assigned client number
        if self.client_num.is_none() {
            let Some((&first, rest)) = data.split_first() else {
                return Ok(());
            };
            self.client_num = Some(first);
            info!(client = first, "assigned client number");
            data = rest;
        }

        let mut vm_output = Vec::new();

        if let Some(sync) = self.sync.as_mut() {
            let mut replies = Vec::new();
            let done = sync.process_message(&mut self.vm, data, &mut vm_output, &mut replies)?;
            for reply in replies {
                self.conn.send(&reply).await?;
            }
            if done {
                self.sync = None;
                debug!("sync complete");
                if !self.delayed_packets.is_empty() {
                    let delayed = std::mem::take(&mut self.delayed_packets);
                    self.conn.send(&delayed).await?;
                }
            }
        } else {
            let mut buf = InputByteBuf::new(data);
            while !buf.eof() {
                match buf.read_ubyte()? {
                    leader_msg::SEND_TICK_DATA => {
                        let length = buf.read_var_int()? as usize;
                        if length == 0 || length > buf.remaining() {
                            return Err(LobbyError::Sync("invalid length"));
                        }
                        let ticks = buf.read_raw(length)?;
                        self.vm.run_ticks(ticks, Some(&mut vm_output))?;
                        self.local_checkpoints.extend(self.vm.take_checkpoints());
                    }
                    leader_msg::SEND_CHECKSUM => {
                        self.leader_checkpoints.push_back(Checkpoint {
                            timer_ms: buf.read_u32()?,
                            checksum: buf.read_u64()?,
                        });
                    }
                    _ => return Err(LobbyError::Sync("invalid message from leader")),
                }
                self.check_for_desync()?;
            }
        }

        self.filter_vm_output(&vm_output)?;
        Ok(())
    }

    /// Compares leader and local checkpoints, aligned by VM time: an
    /// entry with no same-time counterpart on the other side is dropped
    /// (it covers ticks run during sync), equal times must have equal
    /// checksums.
    fn check_for_desync(&mut self) -> Result<(), LobbyError> {
        while let (Some(local), Some(leader)) = (
            self.local_checkpoints.front().copied(),
            self.leader_checkpoints.front().copied(),
        ) {
            if local.timer_ms == leader.timer_ms {
                if local.checksum != leader.checksum {
                    return Err(LobbyError::Desync {
                        timer_ms: local.timer_ms,
                    });
                }
                self.local_checkpoints.pop_front();
                self.leader_checkpoints.pop_front();
            } else if local.timer_ms < leader.timer_ms {
                self.local_checkpoints.pop_front();
            } else {
                self.leader_checkpoints.pop_front();
            }
        }
        Ok(())
    }

    /// Keeps only output addressed to the local client number.
    fn filter_vm_output(&mut self, vm_output: &[u8]) -> Result<(), LobbyError> {
        let Some(local) = self.client_num else {
            return Ok(());
        };

        struct Filter<'a> {
            local: u8,
            out: &'a mut Vec<u8>,
        }
        impl knights_vm::TickSink for Filter<'_> {
            fn on_server_send_data(
                &mut self,
                client: u8,
                data: &[u8],
            ) -> Result<(), knights_vm::VmError> {
                if client == self.local {
                    self.out.extend_from_slice(data);
                }
                Ok(())
            }
        }

        let mut filter = Filter {
            local,
            out: &mut self.local_player_packets,
        };
        knights_vm::read_all_ticks(vm_output, &mut filter)?;
        Ok(())
    }

    /// Extracts the VM for host migration (promotion to leader), running
    /// a final tick that closes every connection.
    pub fn migrate(mut self) -> Result<KnightsVm, LobbyError> {
        let mut writer = TickWriter::new();
        writer.write_close_all_connections()?;
        let mut final_tick = Vec::new();
        writer.finalize_into(&mut final_tick, 1)?;
        self.vm.run_ticks(&final_tick, None)?;
        Ok(self.vm)
    }
}
