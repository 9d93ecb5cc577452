//! Leader-side late-joiner sync.
//!
//! On creation the host snapshots the leader VM's memory into hashed
//! blocks and sends the VM config. Once the follower's hashes arrive,
//! blocks they already have are dropped and the rest go out compressed,
//! interleaved with any catch-up ticks the running game produces in the
//! meantime. A bounded outstanding window provides flow control; sync is
//! declared done when nothing is left to send, every block is
//! acknowledged and at most a small margin of tick segments is still in
//! flight.

use std::collections::VecDeque;

use knights_protocol::{leader_msg, follower_msg, InputByteBuf, OutputByteBuf};
use knights_vm::{compare_memory_hashes, KnightsVm, MemoryBlock};

use crate::compress::BlockCompressor;
use crate::LobbyError;

/// Flow-control window: blocks plus tick segments in flight.
const MAX_BLOCKS_AND_SEGMENTS_OUTSTANDING: usize = 200;

/// Catch-up ticks are packed into segments of roughly this many bytes.
const TICK_SEGMENT_SIZE: usize = 4000;

/// `SyncDone` may be sent while up to this many segments are still
/// unacknowledged.
const TICK_MARGIN_SEGMENTS: usize = 20;

/// One follower's sync, from the leader's side.
pub struct SyncHost {
    memory_blocks: VecDeque<MemoryBlock>,
    catchup_segments: VecDeque<Vec<u8>>,
    compressor: BlockCompressor,
    hashes_received: bool,
    blocks_outstanding: usize,
    segments_outstanding: usize,
}

impl SyncHost {
    /// Snapshots the VM and builds the initial `SendVMConfig` packet.
    pub fn new(vm: &KnightsVm) -> (Self, Vec<u8>) {
        let mut msg = Vec::new();
        let mut buf = OutputByteBuf::new(&mut msg);
        buf.write_ubyte(leader_msg::SEND_VM_CONFIG);
        vm.vm_config().write(&mut buf);

        (
            SyncHost {
                memory_blocks: vm.memory_blocks(),
                catchup_segments: VecDeque::new(),
                compressor: BlockCompressor::new(),
                hashes_received: false,
                blocks_outstanding: 0,
                segments_outstanding: 0,
            },
            msg,
        )
    }

    /// Queues tick data produced while this sync is in progress, packing
    /// consecutive batches into segments.
    pub fn add_catchup_ticks(&mut self, tick_data: &[u8]) {
        match self.catchup_segments.back_mut() {
            Some(seg) if seg.len() + tick_data.len() <= TICK_SEGMENT_SIZE => {
                seg.extend_from_slice(tick_data);
            }
            _ => self.catchup_segments.push_back(tick_data.to_vec()),
        }
    }

    /// Handles one packet from the follower, pushing reply packets into
    /// `replies`. Returns true when the sync is complete.
    pub fn process_message(
        &mut self,
        data: &[u8],
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<bool, LobbyError> {
        let mut buf = InputByteBuf::new(data);
        while !buf.eof() {
            match buf.read_ubyte()? {
                follower_msg::SEND_HASHES => self.receive_hashes(&mut buf)?,
                follower_msg::ACK_MEMORY_BLOCKS => {
                    let n = buf.read_var_int()? as usize;
                    if n < 1 || n > self.blocks_outstanding {
                        return Err(LobbyError::Sync("invalid block ack"));
                    }
                    self.blocks_outstanding -= n;
                }
                follower_msg::ACK_CATCHUP_TICKS => {
                    let n = buf.read_var_int()? as usize;
                    if n < 1 || n > self.segments_outstanding {
                        return Err(LobbyError::Sync("invalid tick segment ack"));
                    }
                    self.segments_outstanding -= n;
                }
                _ => return Err(LobbyError::Sync("invalid follower command")),
            }

            if self.fill_window(replies)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn receive_hashes(&mut self, buf: &mut InputByteBuf<'_>) -> Result<(), LobbyError> {
        if self.hashes_received {
            return Err(LobbyError::Sync("hashes already received"));
        }
        let count = buf.read_var_int()? as usize;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push((buf.read_u32()?, buf.read_u64()?));
        }

        // blocks the follower already has need not be sent
        compare_memory_hashes(&hashes, &mut self.memory_blocks);
        self.trim_memory_blocks();
        self.hashes_received = true;
        Ok(())
    }

    /// Sends as much as the outstanding window allows: memory blocks
    /// first, then catch-up tick segments. Returns true when the sync is
    /// complete (a `SyncDone` was emitted).
    fn fill_window(&mut self, replies: &mut Vec<Vec<u8>>) -> Result<bool, LobbyError> {
        if !self.hashes_received {
            return Ok(false);
        }

        while self.blocks_outstanding + self.segments_outstanding
            < MAX_BLOCKS_AND_SEGMENTS_OUTSTANDING
        {
            if !self.memory_blocks.is_empty() {
                let mut msg = vec![leader_msg::SEND_MEMORY_BLOCK];
                let n = self
                    .compressor
                    .append_group(&mut self.memory_blocks, &mut msg)?;
                self.trim_memory_blocks();
                if n == 0 {
                    continue; // only empty blocks remained
                }
                self.blocks_outstanding += n;
                replies.push(msg);
            } else if let Some(segment) = self.catchup_segments.pop_front() {
                let mut msg = Vec::with_capacity(segment.len() + 5);
                let mut buf = OutputByteBuf::new(&mut msg);
                buf.write_ubyte(leader_msg::SEND_CATCHUP_TICKS);
                buf.write_var_int(segment.len() as u32);
                buf.write_raw(&segment);
                self.segments_outstanding += 1;
                replies.push(msg);
            } else {
                break; // nothing left to send at this time
            }
        }

        // declare victory only once every block is acknowledged and at
        // most a margin of tick segments remains in flight
        let done = self.memory_blocks.is_empty()
            && self.catchup_segments.is_empty()
            && self.blocks_outstanding == 0
            && self.segments_outstanding < TICK_MARGIN_SEGMENTS;
        if done {
            replies.push(vec![leader_msg::SYNC_DONE]);
        }
        Ok(done)
    }

    /// Pops hash-matched (emptied) blocks off the front so the next
    /// ready-to-send block is first.
    fn trim_memory_blocks(&mut self) {
        while self
            .memory_blocks
            .front()
            .is_some_and(|b| b.contents.is_empty())
        {
            self.memory_blocks.pop_front();
        }
    }
}

/// Serializes a `SendHashes` packet (the follower side of the first
/// exchange; kept here so host and client agree on the layout).
pub(crate) fn write_hashes_packet(hashes: &[(u32, u64)]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(5 + hashes.len() * 12);
    let mut buf = OutputByteBuf::new(&mut msg);
    buf.write_ubyte(follower_msg::SEND_HASHES);
    buf.write_var_int(hashes.len() as u32);
    for &(base, hash) in hashes {
        buf.write_u32(base);
        buf.write_u64(hash);
    }
    msg
}
