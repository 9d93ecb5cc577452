//! Memory-block group compression.
//!
//! Blocks travel in groups of up to 8, deflate-compressed through one
//! persistent stream per sync (sync-flushed after each group, so each
//! group is decodable as soon as it arrives while later groups still
//! benefit from the shared dictionary). A group is prefixed by 8
//! little-endian 32-bit base addresses (zero-padded; zero never occurs as
//! a real address) and one little-endian 32-bit compressed length.

use std::collections::VecDeque;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use knights_protocol::HOST_MIGRATION_BLOCK_SIZE_BYTES;
use knights_vm::MemoryBlock;

use crate::LobbyError;

/// Blocks per compressed group.
const MAX_BLOCKS_PER_GROUP: usize = 8;

/// Compressing side of the persistent stream.
pub struct BlockCompressor {
    stream: Compress,
}

impl Default for BlockCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCompressor {
    pub fn new() -> Self {
        BlockCompressor {
            stream: Compress::new(Compression::default(), true),
        }
    }

    /// Pops up to 8 non-empty blocks from the queue and appends one
    /// compressed group to `output`. Returns the number of blocks taken
    /// (zero if the queue held no non-empty blocks).
    pub fn append_group(
        &mut self,
        blocks: &mut VecDeque<MemoryBlock>,
        output: &mut Vec<u8>,
    ) -> Result<usize, LobbyError> {
        let mut selected = Vec::with_capacity(MAX_BLOCKS_PER_GROUP);
        while selected.len() < MAX_BLOCKS_PER_GROUP {
            let Some(block) = blocks.pop_front() else {
                break;
            };
            if !block.contents.is_empty() {
                selected.push(block);
            }
        }
        if selected.is_empty() {
            return Ok(0);
        }

        // 8 base addresses, zero-padded
        for i in 0..MAX_BLOCKS_PER_GROUP {
            let base = selected.get(i).map_or(0, |b| b.base_address);
            output.extend_from_slice(&base.to_le_bytes());
        }

        let mut input = Vec::with_capacity(selected.len() * HOST_MIGRATION_BLOCK_SIZE_BYTES as usize);
        for block in &selected {
            input.extend_from_slice(&block.contents);
        }

        // compress with a sync flush so the stream state carries over
        let mut compressed = Vec::with_capacity(input.len() + input.len() / 1000 + 64);
        let mut consumed = 0usize;
        loop {
            let before_in = self.stream.total_in();
            self.stream
                .compress_vec(&input[consumed..], &mut compressed, FlushCompress::Sync)
                .map_err(|_| LobbyError::Compression("deflate failed"))?;
            consumed += (self.stream.total_in() - before_in) as usize;
            // a full output buffer means the flush may be incomplete
            if consumed == input.len() && compressed.len() < compressed.capacity() {
                break;
            }
            compressed.reserve(1024 + compressed.len() / 2);
        }

        output.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        output.extend_from_slice(&compressed);
        Ok(selected.len())
    }
}

/// Decompressing side of the persistent stream.
pub struct BlockDecompressor {
    stream: Decompress,
}

impl Default for BlockDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecompressor {
    pub fn new() -> Self {
        BlockDecompressor {
            stream: Decompress::new(true),
        }
    }

    /// Reads one group from `input` starting at `*pos`, advancing `*pos`
    /// past it. Returns the (base address, contents) pairs.
    pub fn read_group(
        &mut self,
        input: &[u8],
        pos: &mut usize,
    ) -> Result<Vec<(u32, Vec<u8>)>, LobbyError> {
        let read_u32 = |input: &[u8], pos: &mut usize| -> Result<u32, LobbyError> {
            let bytes = input
                .get(*pos..*pos + 4)
                .ok_or(LobbyError::Compression("group truncated"))?;
            *pos += 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            Ok(u32::from_le_bytes(raw))
        };

        let mut bases = [0u32; MAX_BLOCKS_PER_GROUP];
        for base in &mut bases {
            *base = read_u32(input, pos)?;
        }
        let compressed_len = read_u32(input, pos)? as usize;
        let compressed = input
            .get(*pos..*pos + compressed_len)
            .ok_or(LobbyError::Compression("group truncated"))?;
        *pos += compressed_len;

        // zero addresses pad the tail of the group
        let count = bases.iter().take_while(|&&b| b != 0).count();
        if count == 0 || compressed_len == 0 {
            return Err(LobbyError::Compression("empty group"));
        }

        let expected = count * HOST_MIGRATION_BLOCK_SIZE_BYTES as usize;
        let mut decompressed: Vec<u8> = Vec::with_capacity(expected);
        let mut consumed = 0usize;
        while decompressed.len() < expected {
            let before_in = self.stream.total_in();
            let before_out = decompressed.len();
            let status = self
                .stream
                .decompress_vec(
                    &compressed[consumed..],
                    &mut decompressed,
                    FlushDecompress::Sync,
                )
                .map_err(|_| LobbyError::Compression("inflate failed"))?;
            consumed += (self.stream.total_in() - before_in) as usize;
            if status == Status::StreamEnd {
                break;
            }
            if consumed == compressed_len && decompressed.len() == before_out {
                // input exhausted with no progress: the group is short
                return Err(LobbyError::Compression("group size mismatch"));
            }
        }
        if decompressed.len() != expected {
            return Err(LobbyError::Compression("group size mismatch"));
        }

        Ok(bases[..count]
            .iter()
            .enumerate()
            .map(|(i, &base)| {
                let start = i * HOST_MIGRATION_BLOCK_SIZE_BYTES as usize;
                let end = start + HOST_MIGRATION_BLOCK_SIZE_BYTES as usize;
                (base, decompressed[start..end].to_vec())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knights_vm::hash64;

    fn block(base: u32, fill: u8) -> MemoryBlock {
        let contents = vec![fill; HOST_MIGRATION_BLOCK_SIZE_BYTES as usize];
        MemoryBlock {
            base_address: base,
            hash: hash64(&contents),
            contents,
        }
    }

    #[test]
    fn group_round_trip() {
        let mut queue: VecDeque<MemoryBlock> =
            (0..10u32).map(|i| block(0x1000 + i * 512, i as u8)).collect();

        let mut wire = Vec::new();
        let mut comp = BlockCompressor::new();
        let first = comp.append_group(&mut queue, &mut wire).unwrap();
        let second = comp.append_group(&mut queue, &mut wire).unwrap();
        assert_eq!((first, second), (8, 2));
        assert!(queue.is_empty());

        let mut decomp = BlockDecompressor::new();
        let mut pos = 0;
        let group1 = decomp.read_group(&wire, &mut pos).unwrap();
        let group2 = decomp.read_group(&wire, &mut pos).unwrap();
        assert_eq!(pos, wire.len());
        assert_eq!(group1.len(), 8);
        assert_eq!(group2.len(), 2);
        assert_eq!(group1[0].0, 0x1000);
        assert_eq!(group1[3].1, vec![3u8; 512]);
        assert_eq!(group2[1].1, vec![9u8; 512]);
    }

    #[test]
    fn empty_blocks_are_skipped() {
        let mut queue: VecDeque<MemoryBlock> = VecDeque::new();
        queue.push_back(MemoryBlock {
            base_address: 0x1000,
            contents: Vec::new(),
            hash: 0,
        });
        queue.push_back(block(0x1200, 7));

        let mut wire = Vec::new();
        let mut comp = BlockCompressor::new();
        let n = comp.append_group(&mut queue, &mut wire).unwrap();
        assert_eq!(n, 1);

        let mut decomp = BlockDecompressor::new();
        let mut pos = 0;
        let group = decomp.read_group(&wire, &mut pos).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].0, 0x1200);
    }

    #[test]
    fn truncated_group_is_rejected() {
        let mut queue: VecDeque<MemoryBlock> = VecDeque::new();
        queue.push_back(block(0x1000, 1));
        let mut wire = Vec::new();
        BlockCompressor::new()
            .append_group(&mut queue, &mut wire)
            .unwrap();
        wire.truncate(wire.len() - 3);

        let mut pos = 0;
        assert!(BlockDecompressor::new().read_group(&wire, &mut pos).is_err());
    }
}
