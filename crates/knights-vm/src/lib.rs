//! The deterministic Knights server VM and its tick-data codec.
//!
//! In replicated mode the entire server runs inside a deterministic,
//! single-threaded execution environment. The VM is stepped by feeding it
//! **tick frames**: each frame advances the VM clock by its duration
//! field and delivers connection events and client bytes. Outputs come
//! back as `ServerSendData` records in the same format. Determinism holds
//! because (a) all inputs flow through tick frames, (b) the clock only
//! advances with frame headers, and (c) all randomness derives from the
//! seed fixed at VM construction (and carried in the sync config).

mod error;
mod tick;
mod vm;

pub use error::VmError;
pub use tick::{
    decode_length, encode_length, read_all_ticks, read_tick_data, TickSink, TickWriter,
    MAX_TICK_DATA_LENGTH,
};
pub use vm::{
    compare_memory_hashes, hash64, Checkpoint, KnightsVm, MemoryBlock, VmConfig, VM_GAME_NAME,
    VM_SEED_LEN,
};
