use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::Duration;

use crate::error::{BufferError, BufferResult};

/// Default fraction of available memory granted to the write-side buffer pool
/// when no absolute capacity is configured.
const DEFAULT_CAPACITY_RATIO: f64 = 0.6;

/// Default fraction of available memory granted to the read-side budget.
const DEFAULT_READ_CAPACITY_RATIO: f64 = 0.2;

/// Default watermark percentages. Live memory above the high mark starts a
/// flush round; the round targets draining down to the low mark.
const DEFAULT_HIGH_WATERMARK_PCT: f64 = 75.0;
const DEFAULT_LOW_WATERMARK_PCT: f64 = 25.0;

/// Default single-buffer flush size threshold (128 MiB).
const DEFAULT_SINGLE_BUFFER_FLUSH_THRESHOLD: u64 = 128 * 1024 * 1024;

/// Shuffles smaller than this are kept in memory by the watermark picker to
/// avoid small I/Os, unless needed for forward progress. Zero disables the
/// exemption.
const DEFAULT_SHUFFLE_FLUSH_THRESHOLD: u64 = 0;

/// Budget for acquiring a per-app read lock during a watermark flush round.
const DEFAULT_FLUSH_TRY_LOCK_TIMEOUT_MS: u64 = 1000;

/// Default chunk size for the local allocation buffer (4 MiB).
const DEFAULT_LAB_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default fraction of pool capacity the chunk free list may retain.
const DEFAULT_LAB_POOL_RATIO: f64 = 0.5;

/// Default largest allocation served from chunks, as a fraction of the chunk
/// size. Larger payloads go to the general allocator.
const DEFAULT_LAB_MAX_ALLOC_RATIO: f64 = 0.1;

/// Huge-partition policy defaults.
const DEFAULT_HUGE_PARTITION_MEMORY_LIMIT_RATIO: f64 = 0.2;
const DEFAULT_HUGE_PARTITION_SIZE_THRESHOLD: u64 = 20 * 1024 * 1024 * 1024; // 20 GiB
const DEFAULT_HUGE_PARTITION_SIZE_HARD_LIMIT: u64 = 100 * 1024 * 1024 * 1024; // 100 GiB
const DEFAULT_HUGE_PARTITION_SPLIT_LIMIT: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB

/// Storage layout used by each partition buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    /// Blocks kept in client append order.
    LinkedList,
    /// Blocks ordered by `(task_attempt_id, seq_no)` for ordered reads.
    SkipList,
}

impl Default for BufferType {
    fn default() -> Self {
        Self::LinkedList
    }
}

/// Local allocation buffer (chunk allocator) tuning.
///
/// Shuffle blocks are short-lived and small; copying them into pooled
/// fixed-size chunks amortizes frees and keeps a partition's blocks adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabOptions {
    pub enabled: bool,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Fraction of pool capacity the recycled-chunk free list may hold.
    pub pool_ratio: f64,
    /// Largest request served from chunks, as a fraction of `chunk_size`.
    pub max_alloc_ratio: f64,
}

impl Default for LabOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: DEFAULT_LAB_CHUNK_SIZE,
            pool_ratio: DEFAULT_LAB_POOL_RATIO,
            max_alloc_ratio: DEFAULT_LAB_MAX_ALLOC_RATIO,
        }
    }
}

/// Policy knobs for partitions whose accumulated size crosses the huge
/// threshold. The pool itself only consults the external task manager for the
/// huge verdict; these values are surfaced to that collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HugePartitionOptions {
    /// Fraction of pool capacity a single huge partition may pin in memory.
    pub memory_limit_ratio: f64,
    /// Accumulated size at which a partition is considered huge.
    pub size_threshold: u64,
    /// Accumulated size at which writes to the partition are rejected upstream.
    pub size_hard_limit: u64,
    /// Accumulated size at which the partition is split across servers.
    pub split_limit: u64,
}

impl Default for HugePartitionOptions {
    fn default() -> Self {
        Self {
            memory_limit_ratio: DEFAULT_HUGE_PARTITION_MEMORY_LIMIT_RATIO,
            size_threshold: DEFAULT_HUGE_PARTITION_SIZE_THRESHOLD,
            size_hard_limit: DEFAULT_HUGE_PARTITION_SIZE_HARD_LIMIT,
            split_limit: DEFAULT_HUGE_PARTITION_SPLIT_LIMIT,
        }
    }
}

/// Primary configuration surface for the buffer pool.
///
/// `capacity`/`read_capacity` of zero mean "derive from the ratio"; call
/// [`BufferPoolConfig::resolve`] with the available memory figure before
/// constructing the pool. [`BufferPoolConfig::normalized`] repairs
/// out-of-range values, and [`BufferPoolConfig::validate`] refuses fatal
/// combinations at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Absolute write-memory budget in bytes. Zero derives from
    /// `capacity_ratio` at resolve time.
    pub capacity: u64,
    pub capacity_ratio: f64,
    /// Absolute read-memory budget in bytes. Zero derives from
    /// `read_capacity_ratio` at resolve time.
    pub read_capacity: u64,
    pub read_capacity_ratio: f64,

    /// Percentage of capacity at which a watermark flush round starts.
    /// Reconfigurable at runtime.
    pub high_watermark_pct: f64,
    /// Percentage of capacity the flush round drains down towards.
    /// Reconfigurable at runtime.
    pub low_watermark_pct: f64,

    /// Enables the single-buffer fast path for every partition; huge
    /// partitions use it regardless.
    pub single_buffer_flush_enabled: bool,
    pub single_buffer_flush_threshold_bytes: u64,
    /// Block-count trigger for the single-buffer fast path.
    pub single_buffer_flush_blocks: u64,

    /// Shuffles at or below this aggregate size are skipped by the watermark
    /// picker unless needed for forward progress.
    pub shuffle_flush_threshold: u64,
    /// Per-app lock acquisition budget during a watermark flush round.
    pub flush_try_lock_timeout_ms: u64,

    pub buffer_type: BufferType,
    pub lab: LabOptions,
    pub huge_partition: HugePartitionOptions,

    /// When set, every successful append above the high watermark kicks the
    /// dedicated picker worker.
    pub flush_when_caching_data: bool,
    /// When set, a per-app histogram of written block sizes is maintained.
    pub app_block_size_metric_enabled: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            capacity_ratio: DEFAULT_CAPACITY_RATIO,
            read_capacity: 0,
            read_capacity_ratio: DEFAULT_READ_CAPACITY_RATIO,
            high_watermark_pct: DEFAULT_HIGH_WATERMARK_PCT,
            low_watermark_pct: DEFAULT_LOW_WATERMARK_PCT,
            single_buffer_flush_enabled: true,
            single_buffer_flush_threshold_bytes: DEFAULT_SINGLE_BUFFER_FLUSH_THRESHOLD,
            single_buffer_flush_blocks: u64::MAX,
            shuffle_flush_threshold: DEFAULT_SHUFFLE_FLUSH_THRESHOLD,
            flush_try_lock_timeout_ms: DEFAULT_FLUSH_TRY_LOCK_TIMEOUT_MS,
            buffer_type: BufferType::default(),
            lab: LabOptions::default(),
            huge_partition: HugePartitionOptions::default(),
            flush_when_caching_data: false,
            app_block_size_metric_enabled: false,
        }
    }
}

impl BufferPoolConfig {
    /// Fills in ratio-derived capacities from the given available-memory
    /// figure. Explicit non-zero capacities win over ratios.
    pub fn resolve(mut self, available_bytes: u64) -> Self {
        if self.capacity == 0 {
            self.capacity = (available_bytes as f64 * self.capacity_ratio) as u64;
        }
        if self.read_capacity == 0 {
            self.read_capacity = (available_bytes as f64 * self.read_capacity_ratio) as u64;
        }
        self
    }

    /// Returns a copy with out-of-range tuning values clamped into their
    /// working windows. Fatal combinations are left for [`validate`] to
    /// reject.
    ///
    /// [`validate`]: BufferPoolConfig::validate
    pub fn normalized(mut self) -> Self {
        self.high_watermark_pct = self.high_watermark_pct.clamp(0.0, 100.0);
        self.low_watermark_pct = self.low_watermark_pct.clamp(0.0, 100.0);
        if self.single_buffer_flush_blocks == 0 {
            self.single_buffer_flush_blocks = u64::MAX;
        }
        if self.flush_try_lock_timeout_ms == 0 {
            self.flush_try_lock_timeout_ms = DEFAULT_FLUSH_TRY_LOCK_TIMEOUT_MS;
        }
        if self.lab.enabled {
            if self.lab.chunk_size == 0 {
                self.lab.chunk_size = DEFAULT_LAB_CHUNK_SIZE;
            }
            self.lab.pool_ratio = self.lab.pool_ratio.clamp(0.0, 1.0);
            self.lab.max_alloc_ratio = self.lab.max_alloc_ratio.clamp(0.0, 1.0);
        }
        self
    }

    /// Refuses configurations the pool cannot start with.
    pub fn validate(&self) -> BufferResult<()> {
        if self.capacity == 0 {
            return Err(BufferError::invalid_config(
                "buffer pool capacity is zero; set an absolute capacity or resolve the ratio",
            ));
        }
        if self.high_watermark_pct <= self.low_watermark_pct {
            return Err(BufferError::invalid_config(format!(
                "high watermark {}% must exceed low watermark {}%",
                self.high_watermark_pct, self.low_watermark_pct
            )));
        }
        if self.lab.enabled && self.lab.max_alloc_ratio <= 0.0 {
            return Err(BufferError::invalid_config(
                "lab max_alloc_ratio must be positive when the chunk allocator is enabled",
            ));
        }
        Ok(())
    }

    pub fn flush_try_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_try_lock_timeout_ms)
    }

    /// Bytes a single huge partition may pin in the pool.
    pub fn huge_partition_memory_limit(&self) -> u64 {
        (self.capacity as f64 * self.huge_partition.memory_limit_ratio).round() as u64
    }
}

impl Display for BufferPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferPoolConfig(capacity={}, read_capacity={}, high_watermark_pct={}, low_watermark_pct={}, buffer_type={:?}, single_buffer_flush_enabled={}, single_buffer_flush_threshold_bytes={}, shuffle_flush_threshold={}, lab_enabled={}, flush_when_caching_data={})",
            self.capacity,
            self.read_capacity,
            self.high_watermark_pct,
            self.low_watermark_pct,
            self.buffer_type,
            self.single_buffer_flush_enabled,
            self.single_buffer_flush_threshold_bytes,
            self.shuffle_flush_threshold,
            self.lab.enabled,
            self.flush_when_caching_data
        )
    }
}
