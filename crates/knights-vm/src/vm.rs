//! `KnightsVm`: the deterministic server wrapped for replication.
//!
//! The VM owns a cooperative-mode `KnightsServer` with one game
//! (`#VMGame`), a clock that only moves with tick headers, and a fixed
//! random seed. Its entire state serializes to a canonical byte image,
//! which the host-migration layer treats as "VM memory": split into
//! fixed-size blocks with 64-bit hashes, diffed, compressed and shipped
//! to late joiners.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use knights_engine::GameConfig;
use knights_protocol::{
    InputByteBuf, OutputByteBuf, PlayerId, ProtocolError, HOST_MIGRATION_BLOCK_SIZE_BYTES,
};
use knights_server::{KnightsServer, ServerParams, ServerSnapshot};
use knights_session::{Clock, ManualClock, WorkerMode};

use crate::tick::{read_tick_data, TickSink, TickWriter};
use crate::VmError;

/// Name of the single game hosted inside the VM.
pub const VM_GAME_NAME: &str = "#VMGame";

/// Bytes of seed material a VM is constructed with.
pub const VM_SEED_LEN: usize = 32;

/// Base address of the first memory block. Zero is reserved as the
/// "missing block" marker in compressed block groups.
const IMAGE_BASE_ADDR: u32 = 0x1000;

/// A checkpoint checksum is produced whenever the VM clock crosses a
/// multiple of this.
const CHECKPOINT_INTERVAL_MS: u32 = 5000;

/// Recommended sleep when no game worker is due.
const IDLE_SLEEP_MS: u32 = 200;

/// 64-bit content hash used for memory blocks and desync checksums.
pub fn hash64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// One fixed-size region of the VM memory image, with its hash.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    pub base_address: u32,
    /// Emptied when the follower already has identical contents.
    pub contents: Vec<u8>,
    pub hash: u64,
}

/// The redesigned "register file": everything a follower needs besides
/// the memory image itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub seed: [u8; VM_SEED_LEN],
    pub timer_ms: u32,
    /// Exact (unpadded) image length in bytes.
    pub image_len: u32,
}

impl VmConfig {
    pub fn write(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_raw(&self.seed);
        buf.write_u32(self.timer_ms);
        buf.write_u32(self.image_len);
    }

    pub fn read(buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        let mut seed = [0u8; VM_SEED_LEN];
        seed.copy_from_slice(buf.read_raw(VM_SEED_LEN)?);
        Ok(VmConfig {
            seed,
            timer_ms: buf.read_u32()?,
            image_len: buf.read_u32()?,
        })
    }
}

/// A desync-detection checkpoint: the VM clock and the state checksum at
/// that point. Produced at deterministic points so leader and follower
/// streams can be compared entry by entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub timer_ms: u32,
    pub checksum: u64,
}

/// Everything that goes into the serialized memory image.
#[derive(Serialize, Deserialize)]
struct VmImage {
    server: ServerSnapshot,
    client_conns: BTreeMap<u8, u64>,
    timer_ms: u32,
}

/// Sync-in-progress staging: the leader's config plus the image being
/// patched together.
struct SyncStaging {
    config: VmConfig,
    image: Vec<u8>,
}

/// The deterministic Knights server VM.
pub struct KnightsVm {
    server: KnightsServer,
    clock: Arc<ManualClock>,
    config_source: Arc<dyn Fn() -> GameConfig + Send + Sync>,
    seed: [u8; VM_SEED_LEN],
    timer_ms: u32,
    /// client number -> server connection handle
    client_conns: BTreeMap<u8, u64>,
    checkpoints: VecDeque<Checkpoint>,
    last_checkpoint_ms: u32,
    sync: Option<SyncStaging>,
}

impl KnightsVm {
    /// Boots a fresh VM: a cooperative server hosting one empty game
    /// named `#VMGame`, ready for players to join.
    pub fn new(
        seed: [u8; VM_SEED_LEN],
        config_source: Arc<dyn Fn() -> GameConfig + Send + Sync>,
    ) -> Result<Self, VmError> {
        let clock = Arc::new(ManualClock::new(0));
        let mut server = KnightsServer::new(ServerParams {
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            worker_mode: WorkerMode::Cooperative,
            allow_split_screen: false,
            motd: None,
            old_motd: None,
            password: None,
            rng_seed: {
                let mut first = [0u8; 8];
                first.copy_from_slice(&seed[..8]);
                u64::from_le_bytes(first)
            },
        });
        server
            .start_new_game(config_source(), VM_GAME_NAME)
            .map_err(|e| VmError::SimulationFailed(e.to_string()))?;

        Ok(KnightsVm {
            server,
            clock,
            config_source,
            seed,
            timer_ms: 0,
            client_conns: BTreeMap::new(),
            checkpoints: VecDeque::new(),
            last_checkpoint_ms: 0,
            sync: None,
        })
    }

    pub fn timer_ms(&self) -> u32 {
        self.timer_ms
    }

    // -- execution ----------------------------------------------------------

    /// Consumes every tick frame in `data` (or fails without a defined
    /// intermediate state). Output bytes are appended to `output` if
    /// given; they are themselves tick messages, one `ServerSendData`
    /// record per client with pending data. Returns the recommended sleep in
    /// milliseconds (0–1000).
    pub fn run_ticks(
        &mut self,
        data: &[u8],
        mut output: Option<&mut Vec<u8>>,
    ) -> Result<u32, VmError> {
        let mut rest = data;
        let mut sleep_ms = IDLE_SLEEP_MS;
        while !rest.is_empty() {
            let consumed = {
                let mut sink = VmTickSink { vm: self };
                read_tick_data(rest, &mut sink)?
            };
            rest = &rest[consumed..];

            sleep_ms = self.end_of_tick(output.as_deref_mut())?;
        }
        Ok(sleep_ms)
    }

    /// Work done after each frame: pump the game workers, flush server
    /// output, sweep failed sessions, and maybe drop a checkpoint.
    fn end_of_tick(&mut self, output: Option<&mut Vec<u8>>) -> Result<u32, VmError> {
        let now = self.clock.now_ms();
        let next_deadline = self.server.pump_games(now);
        self.server.poll_sessions();

        if let Some(output) = output {
            let mut writer = TickWriter::new();
            for (&client, &conn_id) in &self.client_conns {
                let bytes = self.server.get_output_data(conn_id);
                if !bytes.is_empty() {
                    writer.write_server_send_data(client, &bytes)?;
                }
            }
            writer.finalize_into(output, 0)?;
        } else {
            // outputs are discarded, but must still be drained
            for &conn_id in self.client_conns.values() {
                let _ = self.server.get_output_data(conn_id);
            }
        }

        if self.timer_ms / CHECKPOINT_INTERVAL_MS
            > self.last_checkpoint_ms / CHECKPOINT_INTERVAL_MS
        {
            self.checkpoints.push_back(Checkpoint {
                timer_ms: self.timer_ms,
                checksum: self.checksum(),
            });
        }
        self.last_checkpoint_ms = self.timer_ms;

        let sleep = next_deadline
            .map(|deadline| deadline.saturating_sub(now))
            .unwrap_or(IDLE_SLEEP_MS as u64);
        Ok(sleep.min(1000) as u32)
    }

    /// Checkpoints produced since the last call.
    pub fn take_checkpoints(&mut self) -> Vec<Checkpoint> {
        self.checkpoints.drain(..).collect()
    }

    /// Hash of the full current state.
    pub fn checksum(&self) -> u64 {
        hash64(&self.image_bytes())
    }

    // -- snapshotting -------------------------------------------------------

    fn image_bytes(&self) -> Vec<u8> {
        let image = VmImage {
            server: self.server.snapshot(),
            client_conns: self.client_conns.clone(),
            timer_ms: self.timer_ms,
        };
        postcard::to_allocvec(&image).expect("vm image is always serializable")
    }

    fn padded(mut bytes: Vec<u8>) -> Vec<u8> {
        let block = HOST_MIGRATION_BLOCK_SIZE_BYTES as usize;
        let rem = bytes.len() % block;
        if rem != 0 {
            bytes.resize(bytes.len() + block - rem, 0);
        }
        bytes
    }

    /// The sync "register file".
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            seed: self.seed,
            timer_ms: self.timer_ms,
            image_len: self.image_bytes().len() as u32,
        }
    }

    /// Current memory contents as fixed-size blocks with hashes.
    pub fn memory_blocks(&self) -> VecDeque<MemoryBlock> {
        let image = Self::padded(self.image_bytes());
        image
            .chunks(HOST_MIGRATION_BLOCK_SIZE_BYTES as usize)
            .enumerate()
            .map(|(i, chunk)| MemoryBlock {
                base_address: IMAGE_BASE_ADDR + i as u32 * HOST_MIGRATION_BLOCK_SIZE_BYTES,
                contents: chunk.to_vec(),
                hash: hash64(chunk),
            })
            .collect()
    }

    /// Per-block hashes of the current memory contents.
    pub fn memory_hashes(&self) -> Vec<(u32, u64)> {
        self.memory_blocks()
            .iter()
            .map(|b| (b.base_address, b.hash))
            .collect()
    }

    // -- follower-side sync -------------------------------------------------

    /// Installs the leader's config, staging an image pre-filled with our
    /// own current state (hash-matching blocks then need no transfer).
    pub fn begin_sync(&mut self, config: VmConfig) -> Result<(), VmError> {
        if self.sync.is_some() {
            return Err(VmError::Sync("config already received"));
        }
        let block = HOST_MIGRATION_BLOCK_SIZE_BYTES as usize;
        let padded_len = (config.image_len as usize).div_ceil(block) * block;
        let mut image = Self::padded(self.image_bytes());
        image.resize(padded_len, 0);
        self.sync = Some(SyncStaging { config, image });
        Ok(())
    }

    /// Writes one received block into the staged image.
    pub fn write_memory_block(&mut self, base_address: u32, bytes: &[u8]) -> Result<(), VmError> {
        let staging = self
            .sync
            .as_mut()
            .ok_or(VmError::Sync("config not yet received"))?;
        let offset = base_address
            .checked_sub(IMAGE_BASE_ADDR)
            .ok_or(VmError::Sync("bad block address"))? as usize;
        let end = offset + bytes.len();
        if end > staging.image.len() {
            return Err(VmError::Sync("block out of range"));
        }
        staging.image[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Rebuilds the VM from the completed image. Must be called after all
    /// memory blocks and before any catch-up ticks run.
    pub fn complete_sync(&mut self) -> Result<(), VmError> {
        let Some(staging) = self.sync.take() else {
            return Ok(()); // already synced
        };
        let image_len = staging.config.image_len as usize;
        if image_len > staging.image.len() {
            return Err(VmError::Sync("image length mismatch"));
        }
        let image: VmImage = postcard::from_bytes(&staging.image[..image_len])
            .map_err(|e| VmError::Snapshot(e.to_string()))?;

        self.clock.set(image.timer_ms as u64);
        self.timer_ms = image.timer_ms;
        self.last_checkpoint_ms = image.timer_ms;
        self.seed = staging.config.seed;
        self.checkpoints.clear();

        let config_source = Arc::clone(&self.config_source);
        self.server = KnightsServer::restore(
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            WorkerMode::Cooperative,
            image.server,
            &move || config_source(),
        )
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
        self.client_conns = image.client_conns;
        Ok(())
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync.is_some()
    }
}

/// Compares follower hashes against a block queue, emptying the contents
/// of every block the follower already has.
pub fn compare_memory_hashes(follower_hashes: &[(u32, u64)], blocks: &mut VecDeque<MemoryBlock>) {
    let map: BTreeMap<u32, u64> = follower_hashes.iter().copied().collect();
    for block in blocks.iter_mut() {
        if map.get(&block.base_address) == Some(&block.hash) {
            block.contents.clear();
        }
    }
}

struct VmTickSink<'a> {
    vm: &'a mut KnightsVm,
}

impl TickSink for VmTickSink<'_> {
    fn on_new_tick(&mut self, tick_duration_ms: u32) -> Result<(), VmError> {
        // the only way time advances inside the VM
        self.vm.timer_ms = self.vm.timer_ms.wrapping_add(tick_duration_ms);
        self.vm.clock.advance(tick_duration_ms as u64);
        Ok(())
    }

    fn on_new_connection(&mut self, client: u8, platform_user_id: &str) -> Result<(), VmError> {
        if self.vm.client_conns.contains_key(&client) {
            return Err(VmError::BadClientNumber(client));
        }
        let conn_id = self
            .vm
            .server
            .new_client_connection("", PlayerId::new(platform_user_id));
        self.vm.client_conns.insert(client, conn_id);
        Ok(())
    }

    fn on_close_connection(&mut self, client: u8) -> Result<(), VmError> {
        let conn_id = self
            .vm
            .client_conns
            .remove(&client)
            .ok_or(VmError::BadClientNumber(client))?;
        self.vm.server.connection_closed(conn_id);
        Ok(())
    }

    fn on_close_all_connections(&mut self) -> Result<(), VmError> {
        for (_, conn_id) in std::mem::take(&mut self.vm.client_conns) {
            self.vm.server.connection_closed(conn_id);
        }
        Ok(())
    }

    fn on_client_send_data(&mut self, client: u8, data: &[u8]) -> Result<(), VmError> {
        let conn_id = *self
            .vm
            .client_conns
            .get(&client)
            .ok_or(VmError::BadClientNumber(client))?;
        self.vm.server.receive_input_data(conn_id, data);
        Ok(())
    }

    fn on_client_ping_report(&mut self, client: u8, ping_ms: u16) -> Result<(), VmError> {
        let conn_id = *self
            .vm
            .client_conns
            .get(&client)
            .ok_or(VmError::BadClientNumber(client))?;
        self.vm.server.set_ping_time(conn_id, ping_ms as u32);
        Ok(())
    }

    fn on_server_send_data(&mut self, _client: u8, _data: &[u8]) -> Result<(), VmError> {
        // server output must never appear on the VM's input side
        Err(VmError::TickFormat("server data in input stream"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knights_engine::{ArenaFactory, Manifest};

    fn config_source() -> Arc<dyn Fn() -> GameConfig + Send + Sync> {
        Arc::new(|| GameConfig::new(Arc::new(Manifest::builtin()), Arc::new(ArenaFactory)))
    }

    fn boot(seed_byte: u8) -> KnightsVm {
        KnightsVm::new([seed_byte; VM_SEED_LEN], config_source()).unwrap()
    }

    #[test]
    fn clock_advances_only_with_tick_headers() {
        let mut vm = boot(1);
        assert_eq!(vm.timer_ms(), 0);

        let mut data = Vec::new();
        TickWriter::new().finalize_into(&mut data, 250).unwrap();
        vm.run_ticks(&data, None).unwrap();
        assert_eq!(vm.timer_ms(), 250);
    }

    #[test]
    fn identical_vms_have_identical_images() {
        let mut a = boot(9);
        let mut b = boot(9);

        let mut data = Vec::new();
        let mut w = TickWriter::new();
        w.write_new_connection(0, "alice").unwrap();
        w.finalize_into(&mut data, 100).unwrap();

        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.run_ticks(&data, Some(&mut out_a)).unwrap();
        b.run_ticks(&data, Some(&mut out_b)).unwrap();

        assert_eq!(out_a, out_b);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn block_sync_transfers_state() {
        let mut leader = boot(5);
        // advance the leader so the two VMs differ
        let mut data = Vec::new();
        let mut w = TickWriter::new();
        w.write_new_connection(0, "host").unwrap();
        w.finalize_into(&mut data, 400).unwrap();
        leader.run_ticks(&data, None).unwrap();

        let mut follower = boot(7);
        follower.begin_sync(leader.vm_config()).unwrap();

        let mut blocks = leader.memory_blocks();
        compare_memory_hashes(&follower.memory_hashes(), &mut blocks);
        for block in &blocks {
            if !block.contents.is_empty() {
                follower
                    .write_memory_block(block.base_address, &block.contents)
                    .unwrap();
            }
        }
        follower.complete_sync().unwrap();

        assert_eq!(follower.checksum(), leader.checksum());
        assert_eq!(follower.timer_ms(), leader.timer_ms());
    }

    #[test]
    fn duplicate_config_is_a_sync_error() {
        let mut vm = boot(2);
        vm.begin_sync(vm.vm_config()).unwrap();
        assert!(vm.begin_sync(vm.vm_config()).is_err());
    }
}
