//! Follower-side late-joiner sync.

use knights_protocol::{leader_msg, InputByteBuf, OutputByteBuf};
use knights_vm::{KnightsVm, VmConfig};

use crate::compress::BlockDecompressor;
use crate::sync_host::write_hashes_packet;
use crate::LobbyError;

/// One sync, from the follower's side. Processes leader packets until
/// `SyncDone`, acknowledging blocks and tick segments in batches.
pub struct SyncClient {
    decompressor: BlockDecompressor,
    vm_config_received: bool,
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncClient {
    pub fn new() -> Self {
        SyncClient {
            decompressor: BlockDecompressor::new(),
            vm_config_received: false,
        }
    }

    /// Handles one packet from the leader. VM output produced by
    /// catch-up ticks is appended to `vm_output`; reply packets to
    /// `replies`. Returns true once the sync is done.
    pub fn process_message(
        &mut self,
        vm: &mut KnightsVm,
        data: &[u8],
        vm_output: &mut Vec<u8>,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<bool, LobbyError> {
        let mut buf = InputByteBuf::new(data);
        let mut blocks_received = 0u32;
        let mut segments_received = 0u32;
        let mut done = false;

        while !done && !buf.eof() {
            match buf.read_ubyte()? {
                leader_msg::SEND_VM_CONFIG => {
                    if self.vm_config_received {
                        return Err(LobbyError::Sync("config already received"));
                    }
                    let config = VmConfig::read(&mut buf)?;
                    vm.begin_sync(config)?;
                    replies.push(write_hashes_packet(&vm.memory_hashes()));
                    self.vm_config_received = true;
                }

                leader_msg::SEND_MEMORY_BLOCK => {
                    if !self.vm_config_received {
                        return Err(LobbyError::Sync("config not yet received"));
                    }
                    let rest = buf.read_raw(buf.remaining())?;
                    let mut pos = 0usize;
                    let group = self.decompressor.read_group(rest, &mut pos)?;
                    for (base, bytes) in &group {
                        vm.write_memory_block(*base, bytes)?;
                        blocks_received += 1;
                    }
                    // hand unparsed bytes back to the loop
                    buf = InputByteBuf::new(&rest[pos..]);
                }

                leader_msg::SEND_CATCHUP_TICKS => {
                    if !self.vm_config_received {
                        return Err(LobbyError::Sync("config not yet received"));
                    }
                    let length = buf.read_var_int()? as usize;
                    if length == 0 || length > buf.remaining() {
                        return Err(LobbyError::Sync("invalid catchup length"));
                    }
                    let ticks = buf.read_raw(length)?;
                    // all memory blocks precede the first catch-up ticks
                    vm.complete_sync()?;
                    vm.run_ticks(ticks, Some(vm_output))?;
                    segments_received += 1;
                }

                leader_msg::SYNC_DONE => {
                    if !self.vm_config_received {
                        return Err(LobbyError::Sync("config not yet received"));
                    }
                    vm.complete_sync()?;
                    done = true;
                }

                _ => return Err(LobbyError::Sync("invalid leader command")),
            }
        }

        if blocks_received > 0 {
            let mut msg = Vec::new();
            let mut out = OutputByteBuf::new(&mut msg);
            out.write_ubyte(knights_protocol::follower_msg::ACK_MEMORY_BLOCKS);
            out.write_var_int(blocks_received);
            replies.push(msg);
        }
        if segments_received > 0 {
            let mut msg = Vec::new();
            let mut out = OutputByteBuf::new(&mut msg);
            out.write_ubyte(knights_protocol::follower_msg::ACK_CATCHUP_TICKS);
            out.write_var_int(segments_received);
            replies.push(msg);
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_host::SyncHost;
    use knights_engine::{ArenaFactory, GameConfig, Manifest};
    use knights_vm::{TickWriter, VM_SEED_LEN};
    use std::sync::Arc;

    fn config_source() -> Arc<dyn Fn() -> GameConfig + Send + Sync> {
        Arc::new(|| GameConfig::new(Arc::new(Manifest::builtin()), Arc::new(ArenaFactory)))
    }

    fn boot(seed: u8) -> KnightsVm {
        KnightsVm::new([seed; VM_SEED_LEN], config_source()).unwrap()
    }

    /// Full host <-> client sync over an in-memory message exchange,
    /// including catch-up ticks queued mid-sync.
    #[test]
    fn full_sync_converges_replicas() {
        let mut leader_vm = boot(11);

        // advance the leader so the replicas differ meaningfully
        let mut ticks = Vec::new();
        let mut w = TickWriter::new();
        w.write_new_connection(0, "host").unwrap();
        w.finalize_into(&mut ticks, 300).unwrap();
        leader_vm.run_ticks(&ticks, None).unwrap();

        let mut follower_vm = boot(12);
        let (mut host, config_msg) = SyncHost::new(&leader_vm);
        let mut client = SyncClient::new();

        // ticks produced while the sync is in flight become catch-up data
        let mut late_ticks = Vec::new();
        TickWriter::new().finalize_into(&mut late_ticks, 40).unwrap();
        leader_vm.run_ticks(&late_ticks, None).unwrap();
        host.add_catchup_ticks(&late_ticks);

        let mut to_client = vec![config_msg];
        let mut done = false;
        for _round in 0..100 {
            let mut to_host = Vec::new();
            for msg in to_client.drain(..) {
                let mut vm_out = Vec::new();
                if client
                    .process_message(&mut follower_vm, &msg, &mut vm_out, &mut to_host)
                    .unwrap()
                {
                    done = true;
                }
            }
            if done {
                break;
            }
            let mut next = Vec::new();
            for msg in to_host.drain(..) {
                host.process_message(&msg, &mut next).unwrap();
            }
            assert!(!next.is_empty(), "sync stalled");
            to_client = next;
        }

        assert!(done, "sync never completed");
        assert_eq!(follower_vm.checksum(), leader_vm.checksum());
        assert_eq!(follower_vm.timer_ms(), leader_vm.timer_ms());
    }

    #[test]
    fn duplicate_config_is_rejected() {
        let leader_vm = boot(1);
        let mut follower_vm = boot(2);
        let (_host, config_msg) = SyncHost::new(&leader_vm);
        let mut client = SyncClient::new();

        let mut replies = Vec::new();
        let mut out = Vec::new();
        client
            .process_message(&mut follower_vm, &config_msg, &mut out, &mut replies)
            .unwrap();
        assert!(client
            .process_message(&mut follower_vm, &config_msg, &mut out, &mut replies)
            .is_err());
    }
}
