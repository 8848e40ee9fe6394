//! The per-partition sink: an ordered run of live blocks plus the shadow
//! snapshots currently being flushed.
//!
//! Two layouts implement one contract. The linked-list layout keeps client
//! append order; the skip-list layout orders blocks by
//! `(task_attempt_id, seq_no)` for ordered reads. Either may be backed by the
//! chunk allocator, which copies small payloads into pooled slabs at append
//! time.

use std::collections::BTreeMap;
use std::mem;

use croaring::Treemap;
use parking_lot::Mutex;
use tracing::trace;

use crate::block::{Block, BlockData, PartitionedData, ShuffleDataResult, ShuffleKey, INVALID_BLOCK_ID};
use crate::config::BufferType;
use crate::flush::{DataDistribution, FlushEvent};
use crate::lab::ChunkAllocator;
use crate::range_map::PartitionRange;

/// Result of charging an append against a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Blocks accepted. `charged` is the incoming byte total the pool must
    /// account; `replaced` is the byte total of same-key blocks the skip-list
    /// layout displaced (zero for the linked-list layout), already charged on
    /// an earlier append and now free.
    Appended { charged: u64, replaced: u64 },
    /// The buffer is terminal; the caller must treat the partition as
    /// unregistered.
    Evicted,
}

enum LayoutState {
    LinkedList(Vec<Block>),
    SkipList(BTreeMap<(i64, i64), Block>),
}

impl LayoutState {
    fn new(buffer_type: BufferType) -> Self {
        match buffer_type {
            BufferType::LinkedList => LayoutState::LinkedList(Vec::new()),
            BufferType::SkipList => LayoutState::SkipList(BTreeMap::new()),
        }
    }

    fn push(&mut self, block: Block) -> Option<Block> {
        match self {
            LayoutState::LinkedList(blocks) => {
                blocks.push(block);
                None
            }
            LayoutState::SkipList(blocks) => {
                blocks.insert((block.task_attempt_id, block.seq_no), block)
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            LayoutState::LinkedList(blocks) => blocks.len(),
            LayoutState::SkipList(blocks) => blocks.len(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Block> + '_> {
        match self {
            LayoutState::LinkedList(blocks) => Box::new(blocks.iter()),
            LayoutState::SkipList(blocks) => Box::new(blocks.values()),
        }
    }

    /// Removes every block, preserving the layout's iteration order.
    fn drain(&mut self) -> Vec<Block> {
        match self {
            LayoutState::LinkedList(blocks) => mem::take(blocks),
            LayoutState::SkipList(blocks) => mem::take(blocks).into_values().collect(),
        }
    }

    fn clear(&mut self) {
        match self {
            LayoutState::LinkedList(blocks) => blocks.clear(),
            LayoutState::SkipList(blocks) => blocks.clear(),
        }
    }
}

struct BufferState {
    layout: LayoutState,
    /// Snapshots handed to flush events, keyed by event id. Ordered so reads
    /// walk dispatches oldest-first, preserving append order across events.
    in_flush: BTreeMap<u64, Vec<Block>>,
    encoded_length: u64,
    in_flush_length: u64,
    block_count: u64,
    in_flush_block_count: u64,
    evicted: bool,
}

/// One partition's buffer. All mutation happens under the internal mutex;
/// readers collect their iteration plan under the same mutex and compose the
/// result outside it.
pub struct PartitionBuffer {
    state: Mutex<BufferState>,
    allocator: Option<ChunkAllocator>,
}

impl PartitionBuffer {
    pub fn new(buffer_type: BufferType, allocator: Option<ChunkAllocator>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                layout: LayoutState::new(buffer_type),
                in_flush: BTreeMap::new(),
                encoded_length: 0,
                in_flush_length: 0,
                block_count: 0,
                in_flush_block_count: 0,
                evicted: false,
            }),
            allocator,
        }
    }

    /// Appends the delivery's blocks. Returns the bytes to charge, or
    /// [`AppendOutcome::Evicted`] once the buffer is terminal.
    pub fn append(&self, data: PartitionedData) -> AppendOutcome {
        let mut state = self.state.lock();
        if state.evicted {
            return AppendOutcome::Evicted;
        }
        let mut charged = 0u64;
        let mut replaced = 0u64;
        for mut block in data.blocks {
            if let Some(allocator) = &self.allocator {
                if let BlockData::Raw(bytes) = &block.data {
                    block.data = allocator.allocate(bytes);
                }
            }
            charged += block.data_length();
            state.block_count += 1;
            state.encoded_length += block.data_length();
            if let Some(old) = state.layout.push(block) {
                replaced += old.data_length();
                state.block_count -= 1;
                state.encoded_length -= old.data_length();
            }
        }
        AppendOutcome::Appended { charged, replaced }
    }

    /// Atomically snapshots every live block into the in-flush shadow set and
    /// returns the flush event carrying them. Returns `None` when there is
    /// nothing to flush, the buffer is terminal, or the app is no longer
    /// alive.
    pub fn to_flush_event(
        &self,
        key: &ShuffleKey,
        range: PartitionRange,
        event_id: u64,
        distribution: DataDistribution,
        is_huge_partition: bool,
        is_app_alive: impl FnOnce() -> bool,
    ) -> Option<FlushEvent> {
        let mut state = self.state.lock();
        if state.evicted || state.layout.len() == 0 {
            return None;
        }
        if !is_app_alive() {
            return None;
        }
        let blocks = state.layout.drain();
        let encoded_length = state.encoded_length;
        state.in_flush_length += encoded_length;
        state.in_flush_block_count += blocks.len() as u64;
        state.in_flush.insert(event_id, blocks.clone());
        state.encoded_length = 0;
        state.block_count = 0;
        trace!(
            app_id = %key.app_id,
            shuffle_id = key.shuffle_id,
            event_id,
            bytes = encoded_length,
            blocks = blocks.len(),
            "partition buffer snapshotted into flush event"
        );
        Some(FlushEvent::new(
            event_id,
            key.app_id.clone(),
            key.shuffle_id,
            range,
            blocks,
            encoded_length,
            is_huge_partition,
            distribution,
        ))
    }

    /// Drops the snapshot a completed flush event was carrying. Returns the
    /// bytes removed (zero when the buffer was released first).
    pub fn clear_in_flush(&self, event_id: u64) -> u64 {
        let mut state = self.state.lock();
        let Some(blocks) = state.in_flush.remove(&event_id) else {
            return 0;
        };
        let bytes: u64 = blocks.iter().map(Block::data_length).sum();
        state.in_flush_length = state.in_flush_length.saturating_sub(bytes);
        state.in_flush_block_count = state
            .in_flush_block_count
            .saturating_sub(blocks.len() as u64);
        bytes
    }

    /// Reads up to `read_limit` bytes of blocks, resuming after
    /// `last_block_id` ([`INVALID_BLOCK_ID`] reads from the start). In-flush
    /// snapshots are walked before live blocks; an id that is nowhere to be
    /// found falls back to a from-the-start scan.
    pub fn get_shuffle_data(
        &self,
        last_block_id: i64,
        read_limit: u64,
        task_filter: Option<&Treemap>,
    ) -> ShuffleDataResult {
        let plan = {
            let state = self.state.lock();
            let mut cursor = ReadCursor {
                plan: Vec::new(),
                read_len: 0,
                found: last_block_id == INVALID_BLOCK_ID,
                last_block_id,
                read_limit,
                task_filter,
            };
            for fallback_pass in [false, true] {
                if fallback_pass {
                    if cursor.found {
                        break;
                    }
                    // The id was not found anywhere; rescan from the start.
                    cursor.found = true;
                }
                for blocks in state.in_flush.values() {
                    cursor.scan(blocks.iter());
                }
                cursor.scan(state.layout.iter());
            }
            cursor.plan
        };
        ShuffleDataResult::compose(&plan)
    }

    /// Terminal release: drops live blocks and in-flush snapshots and returns
    /// the live bytes freed here. Idempotent; later calls return zero. Bytes
    /// already dispatched settle through their events' completion callbacks.
    pub fn release(&self) -> u64 {
        let mut state = self.state.lock();
        if state.evicted {
            return 0;
        }
        state.evicted = true;
        let live = state.encoded_length;
        state.layout.clear();
        state.in_flush.clear();
        state.encoded_length = 0;
        state.block_count = 0;
        state.in_flush_length = 0;
        state.in_flush_block_count = 0;
        live
    }

    pub fn encoded_length(&self) -> u64 {
        self.state.lock().encoded_length
    }

    pub fn block_count(&self) -> u64 {
        self.state.lock().block_count
    }

    pub fn in_flush_block_count(&self) -> u64 {
        self.state.lock().in_flush_block_count
    }

    pub fn in_flush_length(&self) -> u64 {
        self.state.lock().in_flush_length
    }

    pub fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }
}

struct ReadCursor<'a> {
    plan: Vec<Block>,
    read_len: u64,
    found: bool,
    last_block_id: i64,
    read_limit: u64,
    task_filter: Option<&'a Treemap>,
}

impl ReadCursor<'_> {
    fn scan<'b>(&mut self, blocks: impl Iterator<Item = &'b Block>) {
        for block in blocks {
            if !self.found {
                if block.block_id == self.last_block_id {
                    self.found = true;
                }
                continue;
            }
            if self.read_len >= self.read_limit {
                return;
            }
            if let Some(filter) = self.task_filter {
                if !filter.contains(block.task_attempt_id as u64) {
                    continue;
                }
            }
            self.read_len += block.data_length();
            self.plan.push(block.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn block(block_id: i64, task_attempt_id: i64, len: usize) -> Block {
        Block {
            block_id,
            task_attempt_id,
            seq_no: block_id,
            uncompressed_length: len as i32,
            crc: 0,
            data: BlockData::Raw(Bytes::from(vec![block_id as u8; len])),
        }
    }

    fn blocks(start_id: i64, count: i64, len: usize) -> Vec<Block> {
        (0..count).map(|i| block(start_id + i, 0, len)).collect()
    }

    fn key() -> ShuffleKey {
        ShuffleKey::new("app-1", 0)
    }

    fn range() -> PartitionRange {
        PartitionRange::new(0, 0)
    }

    fn flush(buffer: &PartitionBuffer, event_id: u64) -> Option<FlushEvent> {
        buffer.to_flush_event(
            &key(),
            range(),
            event_id,
            DataDistribution::Normal,
            false,
            || true,
        )
    }

    #[test]
    fn append_charges_incoming_bytes() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        let outcome = buffer.append(PartitionedData::new(0, blocks(0, 10, 10)));
        assert_eq!(
            outcome,
            AppendOutcome::Appended {
                charged: 100,
                replaced: 0
            }
        );
        assert_eq!(buffer.encoded_length(), 100);
        assert_eq!(buffer.block_count(), 10);
        assert_eq!(buffer.in_flush_block_count(), 0);
    }

    #[test]
    fn flush_event_snapshots_and_resets() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, blocks(0, 10, 10)));
        let event = flush(&buffer, 1).expect("event");
        assert_eq!(event.encoded_length(), 100);
        assert_eq!(event.blocks().len(), 10);
        assert_eq!(buffer.encoded_length(), 0);
        assert_eq!(buffer.block_count(), 0);
        assert_eq!(buffer.in_flush_block_count(), 10);
        assert_eq!(buffer.in_flush_length(), 100);

        assert_eq!(buffer.clear_in_flush(1), 100);
        assert_eq!(buffer.in_flush_block_count(), 0);
        assert_eq!(buffer.in_flush_length(), 0);
    }

    #[test]
    fn empty_or_dead_buffers_produce_no_event() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        assert!(flush(&buffer, 1).is_none());

        buffer.append(PartitionedData::new(0, blocks(0, 1, 8)));
        let dead = buffer.to_flush_event(
            &key(),
            range(),
            2,
            DataDistribution::Normal,
            false,
            || false,
        );
        assert!(dead.is_none());
        assert_eq!(buffer.encoded_length(), 8);
    }

    #[test]
    fn read_walks_in_flush_then_live() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, blocks(0, 3, 5)));
        flush(&buffer, 1).expect("event");
        buffer.append(PartitionedData::new(0, blocks(3, 2, 5)));

        let first = buffer.get_shuffle_data(INVALID_BLOCK_ID, 15, None);
        assert_eq!(first.segments.len(), 3);
        assert_eq!(first.segments.last().unwrap().block_id, 2);

        let second = buffer.get_shuffle_data(2, 15, None);
        assert_eq!(second.segments.len(), 2);
        assert_eq!(second.segments.last().unwrap().block_id, 4);
    }

    #[test]
    fn unknown_block_id_falls_back_to_start() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, blocks(0, 4, 10)));
        let result = buffer.get_shuffle_data(99, 100, None);
        assert_eq!(result.segments.len(), 4);
        assert_eq!(result.segments[0].block_id, 0);
    }

    #[test]
    fn block_id_zero_is_a_valid_resume_point() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, vec![block(100, 0, 10), block(0, 0, 10)]));
        let mut last_block_id = INVALID_BLOCK_ID;
        let mut reads = 0;
        loop {
            let result = buffer.get_shuffle_data(last_block_id, 19, None);
            if result.segments.is_empty() {
                break;
            }
            last_block_id = result.segments.last().unwrap().block_id;
            reads += 1;
            assert!(reads <= 2, "reader must terminate");
        }
        assert_eq!(reads, 1);
        assert_eq!(last_block_id, 0);
    }

    #[test]
    fn read_limit_bounds_the_plan() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, blocks(0, 10, 10)));
        let result = buffer.get_shuffle_data(INVALID_BLOCK_ID, 49, None);
        assert_eq!(result.segments.len(), 5);
        assert_eq!(result.data.len(), 50);
    }

    #[test]
    fn task_filter_skips_other_attempts() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(
            0,
            vec![block(0, 1, 10), block(1, 2, 10), block(2, 1, 10)],
        ));
        let mut filter = Treemap::new();
        filter.add(1);
        let result = buffer.get_shuffle_data(INVALID_BLOCK_ID, 100, Some(&filter));
        let ids: Vec<i64> = result.segments.iter().map(|s| s.block_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn skip_list_orders_by_task_then_seq() {
        let buffer = PartitionBuffer::new(BufferType::SkipList, None);
        let mut b1 = block(10, 2, 4);
        b1.seq_no = 0;
        let mut b2 = block(11, 1, 4);
        b2.seq_no = 1;
        let mut b3 = block(12, 1, 4);
        b3.seq_no = 0;
        buffer.append(PartitionedData::new(0, vec![b1, b2, b3]));

        let result = buffer.get_shuffle_data(INVALID_BLOCK_ID, 100, None);
        let ids: Vec<i64> = result.segments.iter().map(|s| s.block_id).collect();
        assert_eq!(ids, vec![12, 11, 10]);
    }

    #[test]
    fn skip_list_replaces_duplicate_keys() {
        let buffer = PartitionBuffer::new(BufferType::SkipList, None);
        let first = block(7, 3, 10);
        let mut retry = block(7, 3, 10);
        retry.seq_no = first.seq_no;
        buffer.append(PartitionedData::new(0, vec![first]));
        let outcome = buffer.append(PartitionedData::new(0, vec![retry]));
        assert_eq!(
            outcome,
            AppendOutcome::Appended {
                charged: 10,
                replaced: 10
            }
        );
        assert_eq!(buffer.block_count(), 1);
        assert_eq!(buffer.encoded_length(), 10);
    }

    #[test]
    fn release_is_terminal_and_idempotent() {
        let buffer = PartitionBuffer::new(BufferType::LinkedList, None);
        buffer.append(PartitionedData::new(0, blocks(0, 4, 25)));
        flush(&buffer, 1).expect("event");
        buffer.append(PartitionedData::new(0, blocks(4, 2, 25)));

        assert_eq!(buffer.release(), 50);
        assert_eq!(buffer.release(), 0);
        assert!(buffer.is_evicted());
        assert!(matches!(
            buffer.append(PartitionedData::new(0, blocks(9, 1, 4))),
            AppendOutcome::Evicted
        ));
        assert!(flush(&buffer, 2).is_none());
        assert!(buffer
            .get_shuffle_data(INVALID_BLOCK_ID, 1000, None)
            .is_empty());
    }

    #[test]
    fn lab_backed_buffer_copies_into_chunks() {
        use crate::lab::{ChunkAllocator, LabConfig};

        let allocator = ChunkAllocator::new(LabConfig::new(1024, 4096, 256));
        let buffer = PartitionBuffer::new(BufferType::LinkedList, Some(allocator.clone()));
        buffer.append(PartitionedData::new(0, blocks(0, 8, 16)));
        assert_eq!(allocator.metrics().chunks_created, 1);

        let result = buffer.get_shuffle_data(INVALID_BLOCK_ID, 1024, None);
        assert_eq!(result.segments.len(), 8);
        assert_eq!(&result.data[0..16], &[0u8; 16][..]);
    }
}
