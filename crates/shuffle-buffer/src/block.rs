use std::fmt::{self, Display};

use bytes::{Bytes, BytesMut};

use crate::lab::LabSlice;

/// Sentinel block id meaning "read from the start of the buffer". Block id
/// zero is a valid id.
pub const INVALID_BLOCK_ID: i64 = -1;

/// Opaque block payload. Either a plain heap allocation or a region carved
/// out of a pooled chunk. Immutable after append; clones are cheap reference
/// bumps in both cases.
#[derive(Debug, Clone)]
pub enum BlockData {
    Raw(Bytes),
    Lab(LabSlice),
}

impl BlockData {
    pub fn len(&self) -> usize {
        match self {
            BlockData::Raw(bytes) => bytes.len(),
            BlockData::Lab(slice) => slice.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockData::Raw(bytes) => bytes.as_ref(),
            BlockData::Lab(slice) => slice.as_slice(),
        }
    }
}

impl From<Bytes> for BlockData {
    fn from(bytes: Bytes) -> Self {
        BlockData::Raw(bytes)
    }
}

/// The unit of client-delivered shuffle data: opaque bytes plus the metadata
/// the reader needs to reassemble and verify them.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: i64,
    pub task_attempt_id: i64,
    pub seq_no: i64,
    pub uncompressed_length: i32,
    pub crc: i64,
    pub data: BlockData,
}

impl Block {
    /// Encoded payload length, the quantity charged against the pool.
    pub fn data_length(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One `cache_shuffle_data` delivery: the target partition plus its blocks.
#[derive(Debug, Clone)]
pub struct PartitionedData {
    pub partition_id: i32,
    pub blocks: Vec<Block>,
}

impl PartitionedData {
    pub fn new(partition_id: i32, blocks: Vec<Block>) -> Self {
        Self {
            partition_id,
            blocks,
        }
    }

    pub fn total_data_length(&self) -> u64 {
        self.blocks.iter().map(Block::data_length).sum()
    }
}

/// Identity of one shuffle stage within a tenant app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShuffleKey {
    pub app_id: String,
    pub shuffle_id: i32,
}

impl ShuffleKey {
    pub fn new(app_id: impl Into<String>, shuffle_id: i32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
        }
    }
}

impl Display for ShuffleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.app_id, self.shuffle_id)
    }
}

/// Location of one block inside a composed read result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegment {
    pub block_id: i64,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: i32,
    pub crc: i64,
    pub task_attempt_id: i64,
}

/// Blocks read from a partition buffer, composed into one contiguous byte
/// run with per-block segment descriptors.
#[derive(Debug, Clone, Default)]
pub struct ShuffleDataResult {
    pub segments: Vec<DataSegment>,
    pub data: Bytes,
}

impl ShuffleDataResult {
    /// Composes the result from an iteration plan collected by a buffer.
    pub(crate) fn compose(blocks: &[Block]) -> Self {
        let total: usize = blocks.iter().map(|b| b.data.len()).sum();
        let mut data = BytesMut::with_capacity(total);
        let mut segments = Vec::with_capacity(blocks.len());
        let mut offset = 0u64;
        for block in blocks {
            let payload = block.data.as_slice();
            data.extend_from_slice(payload);
            segments.push(DataSegment {
                block_id: block.block_id,
                offset,
                length: payload.len() as u32,
                uncompressed_length: block.uncompressed_length,
                crc: block.crc,
                task_attempt_id: block.task_attempt_id,
            });
            offset += payload.len() as u64;
        }
        Self {
            segments,
            data: data.freeze(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(block_id: i64, payload: &[u8]) -> Block {
        Block {
            block_id,
            task_attempt_id: 0,
            seq_no: block_id,
            uncompressed_length: payload.len() as i32,
            crc: 0,
            data: BlockData::Raw(Bytes::copy_from_slice(payload)),
        }
    }

    #[test]
    fn compose_concatenates_in_order() {
        let blocks = vec![block(1, b"abc"), block(2, b"defgh")];
        let result = ShuffleDataResult::compose(&blocks);
        assert_eq!(result.data.as_ref(), b"abcdefgh");
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.segments[0].offset, 0);
        assert_eq!(result.segments[0].length, 3);
        assert_eq!(result.segments[1].offset, 3);
        assert_eq!(result.segments[1].block_id, 2);
    }

    #[test]
    fn partitioned_data_length_sums_blocks() {
        let data = PartitionedData::new(3, vec![block(1, b"ab"), block(2, b"cd")]);
        assert_eq!(data.total_data_length(), 4);
    }

    #[test]
    fn shuffle_key_display() {
        assert_eq!(ShuffleKey::new("app-1", 7).to_string(), "app-1_7");
    }
}
