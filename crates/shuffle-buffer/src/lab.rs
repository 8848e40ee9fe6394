//! Local allocation buffer: a slab-style arena that co-locates many small
//! block copies inside fixed-size chunks. Freeing the last handle of a chunk
//! returns the whole chunk to a bounded free list, so a partition's worth of
//! blocks is reclaimed in one step instead of thousands.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::block::BlockData;

/// Resolved chunk allocator sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Total bytes the recycled-chunk free list may retain.
    pub pool_capacity: u64,
    /// Largest request served from chunks; bigger payloads fall back to the
    /// general allocator.
    pub max_alloc: usize,
}

impl LabConfig {
    pub fn new(chunk_size: usize, pool_capacity: u64, max_alloc: usize) -> Self {
        Self {
            chunk_size,
            pool_capacity,
            max_alloc: max_alloc.min(chunk_size),
        }
    }

    fn max_pooled_chunks(&self) -> usize {
        (self.pool_capacity / self.chunk_size.max(1) as u64) as usize
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LabMetricsSnapshot {
    pub chunks_created: u64,
    pub chunks_recycled: u64,
    pub chunks_discarded: u64,
    pub pooled_chunks: u64,
    pub fallback_allocations: u64,
}

#[derive(Debug, Default)]
struct LabMetrics {
    chunks_created: AtomicU64,
    chunks_recycled: AtomicU64,
    chunks_discarded: AtomicU64,
    pooled_chunks: AtomicU64,
    fallback_allocations: AtomicU64,
}

impl LabMetrics {
    fn snapshot(&self) -> LabMetricsSnapshot {
        LabMetricsSnapshot {
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            chunks_recycled: self.chunks_recycled.load(Ordering::Relaxed),
            chunks_discarded: self.chunks_discarded.load(Ordering::Relaxed),
            pooled_chunks: self.pooled_chunks.load(Ordering::Relaxed),
            fallback_allocations: self.fallback_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-size slab. Regions are carved under the allocator mutex; a region
/// is written exactly once before its handle escapes and never mutated
/// afterwards, so concurrent handle reads never observe a write.
struct Chunk {
    storage: UnsafeCell<Box<[u8]>>,
    /// Live handles into this chunk.
    outstanding: AtomicUsize,
    /// Set once the allocator stops carving from this chunk; only a retired
    /// chunk with zero outstanding handles may be recycled.
    retired: AtomicBool,
    /// Claim flag so the retire path and the last handle drop cannot both
    /// recycle the same chunk.
    recycled: AtomicBool,
}

// SAFETY: `storage` is only written while the allocator's state mutex is
// held and only in regions no handle points at yet; after a handle is
// published its region is immutable until the chunk is recycled, which
// requires `outstanding == 0`.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            storage: UnsafeCell::new(vec![0u8; chunk_size].into_boxed_slice()),
            outstanding: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            recycled: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to one immutable region of a chunk. Dropping the last handle of a
/// retired chunk recycles the chunk.
pub struct LabSlice {
    chunk: Arc<Chunk>,
    allocator: Weak<AllocatorInner>,
    offset: usize,
    len: usize,
}

impl LabSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region [offset, offset + len) was fully written before
        // this handle was handed out and stays immutable while any handle
        // into the chunk is alive (see `Chunk`).
        unsafe { &(&*self.chunk.storage.get())[self.offset..self.offset + self.len] }
    }
}

impl Deref for LabSlice {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl Clone for LabSlice {
    fn clone(&self) -> Self {
        self.chunk.outstanding.fetch_add(1, Ordering::AcqRel);
        Self {
            chunk: Arc::clone(&self.chunk),
            allocator: self.allocator.clone(),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl Drop for LabSlice {
    fn drop(&mut self) {
        if self.chunk.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(allocator) = self.allocator.upgrade() {
                allocator.try_recycle(&self.chunk);
            }
        }
    }
}

impl fmt::Debug for LabSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabSlice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

struct CurrentChunk {
    chunk: Arc<Chunk>,
    write_pos: usize,
}

#[derive(Default)]
struct AllocatorState {
    current: Option<CurrentChunk>,
    free: Vec<Arc<Chunk>>,
}

struct AllocatorInner {
    config: LabConfig,
    state: Mutex<AllocatorState>,
    metrics: LabMetrics,
}

impl AllocatorInner {
    fn try_recycle(&self, chunk: &Arc<Chunk>) {
        if !chunk.retired.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        self.recycle_locked(&mut state, chunk);
    }

    fn recycle_locked(&self, state: &mut AllocatorState, chunk: &Arc<Chunk>) {
        // Re-verify under the mutex: a late caller may race a recycle that
        // already happened, after which the chunk was popped and reset.
        if !chunk.retired.load(Ordering::Acquire)
            || chunk.outstanding.load(Ordering::Acquire) != 0
        {
            return;
        }
        if chunk
            .recycled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if state.free.len() < self.config.max_pooled_chunks() {
            state.free.push(Arc::clone(chunk));
            self.metrics.chunks_recycled.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .pooled_chunks
                .store(state.free.len() as u64, Ordering::Relaxed);
            trace!(pooled = state.free.len(), "chunk recycled into free list");
        } else {
            self.metrics
                .chunks_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Slab arena serving small payload copies out of pooled chunks. Cheaply
/// cloneable; all clones share one arena.
#[derive(Clone)]
pub struct ChunkAllocator {
    inner: Arc<AllocatorInner>,
}

impl ChunkAllocator {
    pub fn new(config: LabConfig) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                config,
                state: Mutex::new(AllocatorState::default()),
                metrics: LabMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> LabConfig {
        self.inner.config
    }

    pub fn metrics(&self) -> LabMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Copies `payload` into the arena. Payloads above `max_alloc` (and empty
    /// payloads) are served by the general allocator instead.
    pub fn allocate(&self, payload: &[u8]) -> BlockData {
        if payload.is_empty() || payload.len() > self.inner.config.max_alloc {
            self.inner
                .metrics
                .fallback_allocations
                .fetch_add(1, Ordering::Relaxed);
            return BlockData::Raw(Bytes::copy_from_slice(payload));
        }

        let mut state = self.inner.state.lock();
        let needs_fresh = match &state.current {
            Some(current) => {
                self.inner.config.chunk_size - current.write_pos < payload.len()
            }
            None => true,
        };
        if needs_fresh {
            if let Some(current) = state.current.take() {
                // Stop carving; the tail that did not fit is wasted, and the
                // last handle drop recycles the chunk.
                current.chunk.retired.store(true, Ordering::Release);
                if current.chunk.outstanding.load(Ordering::Acquire) == 0 {
                    self.inner.recycle_locked(&mut state, &current.chunk);
                }
            }
            let chunk = match state.free.pop() {
                Some(chunk) => {
                    chunk.retired.store(false, Ordering::Release);
                    chunk.recycled.store(false, Ordering::Release);
                    self.inner
                        .metrics
                        .pooled_chunks
                        .store(state.free.len() as u64, Ordering::Relaxed);
                    chunk
                }
                None => {
                    self.inner
                        .metrics
                        .chunks_created
                        .fetch_add(1, Ordering::Relaxed);
                    Chunk::new(self.inner.config.chunk_size)
                }
            };
            state.current = Some(CurrentChunk {
                chunk,
                write_pos: 0,
            });
        }

        let current = state.current.as_mut().expect("current chunk installed");
        let offset = current.write_pos;
        // SAFETY: carving is serialized by the state mutex; no handle points
        // at [offset, offset + len) yet, so this is the region's only writer.
        unsafe {
            let storage = &mut *current.chunk.storage.get();
            storage[offset..offset + payload.len()].copy_from_slice(payload);
        }
        current.write_pos += payload.len();
        current.chunk.outstanding.fetch_add(1, Ordering::AcqRel);
        BlockData::Lab(LabSlice {
            chunk: Arc::clone(&current.chunk),
            allocator: Arc::downgrade(&self.inner),
            offset,
            len: payload.len(),
        })
    }
}

impl fmt::Debug for ChunkAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("config", &self.inner.config)
            .finish()
    }
}
