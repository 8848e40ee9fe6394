//! In-memory shuffle buffer pool for a remote shuffle server.
//!
//! A bounded, partitioned cache that absorbs per-partition shuffle writes
//! from many concurrent client tasks and releases them to persistent storage
//! in coarse flush batches. It is the write-side admission and batching
//! layer: small client appends become large, aligned flushes while global
//! memory invariants and cross-tenant fairness hold.
//!
//! ## Architecture Overview
//!
//! - **Memory accounting**: four counters (`used`, `pre_allocated`,
//!   `in_flush`, `read_used`) gatekeep admission; watermark comparisons run
//!   against *live* memory (`used - pre_allocated - in_flush`).
//! - **Partition buffers**: per-partition block runs with an atomic
//!   snapshot-to-flush-event handoff; linked-list and skip-list layouts,
//!   optionally backed by the chunk allocator.
//! - **Flush scheduling**: a single-buffer fast path after each append, and
//!   a watermark picker that drains the largest shuffles first.
//! - **Collaborators**: the task manager (per-app locks, expiry, huge
//!   partitions) and the flush manager (event queue, storage layout) are
//!   injected at the trait seam; flush-event completion returns memory to
//!   the pool.
//!
//! ## Key Components
//!
//! - [`BufferPoolManager`]: the façade — register, append, read, flush,
//!   remove.
//! - [`PartitionBuffer`]: one partition's live blocks plus in-flush shadows.
//! - [`MemoryAccountant`]: capacity admission and watermark state.
//! - [`FlushEvent`]: a snapshot batch bound for storage, with idempotent
//!   completion.
//!
//! ## Thread Safety
//!
//! All public APIs are thread-safe. Client-facing operations run on the
//! caller's RPC threads; the only internal thread is the watermark picker
//! worker, woken over a bounded channel so append paths never run the picker
//! inline.

pub mod block;
pub mod buffer;
pub mod config;
pub mod error;
pub mod flush;
pub mod lab;
pub mod memory;
pub mod metrics;
pub mod range_map;
pub mod test_support;

mod manager;

pub use block::{
    Block, BlockData, DataSegment, PartitionedData, ShuffleDataResult, ShuffleKey,
    INVALID_BLOCK_ID,
};
pub use buffer::{AppendOutcome, PartitionBuffer};
pub use config::{BufferPoolConfig, BufferType, HugePartitionOptions, LabOptions};
pub use error::{BufferError, BufferResult, StatusCode};
pub use flush::{DataDistribution, FlushDispatcher, FlushEvent, TaskManager};
pub use lab::{ChunkAllocator, LabConfig, LabMetricsSnapshot, LabSlice};
pub use manager::BufferPoolManager;
pub use memory::{MemoryAccountant, MemoryUsageSnapshot, Watermarks};
pub use metrics::{BlockSizeSnapshot, PoolMetrics, PoolMetricsSnapshot};
pub use range_map::{PartitionRange, RangeMap, RangeOverlap};
