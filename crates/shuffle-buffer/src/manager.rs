//! Top-level façade over the buffer pool: registration, admission, append,
//! read, flush scheduling, and removal.
//!
//! Lock hierarchy, acquired top-down only: the pool-global scheduler mutex
//! (watermark picking, commit, shutdown), the per-app read/write lock owned
//! by the task manager (read-held during append-triggered and watermark
//! dispatch, write-held externally during app removal), the per-partition
//! buffer mutex, and finally the lock-free accountant atomics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use croaring::Treemap;
use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::block::{PartitionedData, ShuffleDataResult, ShuffleKey};
use crate::buffer::{AppendOutcome, PartitionBuffer};
use crate::config::BufferPoolConfig;
use crate::error::{BufferResult, StatusCode};
use crate::flush::{FlushDispatcher, TaskManager};
use crate::lab::{ChunkAllocator, LabConfig, LabMetricsSnapshot};
use crate::memory::{MemoryAccountant, MemoryUsageSnapshot};
use crate::metrics::{BlockSizeHistograms, BlockSizeSnapshot, PoolMetrics, PoolMetricsSnapshot};
use crate::range_map::{PartitionRange, RangeMap};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(10);
/// Number of picked shuffles detailed per watermark round in the log.
const PICK_LOG_LIMIT: usize = 10;

type ShuffleBufferMap = DashMap<i32, RwLock<RangeMap<Arc<PartitionBuffer>>>>;

enum PickerCommand {
    Kick,
    Shutdown,
}

/// The buffer pool façade. Cheap to share behind `Arc`; all operations take
/// `&self`.
///
/// Collaborators are injected at construction: the [`TaskManager`] supplies
/// per-app locks, expiry, and the huge-partition verdict; the
/// [`FlushDispatcher`] consumes flush events and eventually completes them,
/// which is what returns dispatched bytes to the pool.
pub struct BufferPoolManager {
    inner: Arc<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(
        config: BufferPoolConfig,
        task_manager: Arc<dyn TaskManager>,
        dispatcher: Arc<dyn FlushDispatcher>,
    ) -> BufferResult<Self> {
        let config = config.normalized();
        config.validate()?;
        info!(%config, "initializing shuffle buffer pool");

        let allocator = config.lab.enabled.then(|| {
            let lab = LabConfig::new(
                config.lab.chunk_size,
                (config.capacity as f64 * config.lab.pool_ratio) as u64,
                (config.lab.chunk_size as f64 * config.lab.max_alloc_ratio) as usize,
            );
            ChunkAllocator::new(lab)
        });
        let metrics = Arc::new(PoolMetrics::default());
        let accountant = Arc::new(MemoryAccountant::new(
            config.capacity,
            config.read_capacity,
            config.high_watermark_pct,
            config.low_watermark_pct,
            Arc::clone(&metrics),
        ));
        let block_size_histograms = BlockSizeHistograms::new(config.app_block_size_metric_enabled);
        let (picker_tx, picker_rx) = bounded(1);
        let inner = Arc::new(PoolInner {
            config,
            allocator,
            accountant,
            metrics,
            block_size_histograms,
            pool: DashMap::new(),
            shuffle_sizes: DashMap::new(),
            task_manager,
            dispatcher,
            scheduler: Mutex::new(()),
            event_seq: AtomicU64::new(1),
            picker_tx,
        });
        Self::spawn_picker(picker_rx, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    fn spawn_picker(rx: Receiver<PickerCommand>, inner: std::sync::Weak<PoolInner>) {
        let _ = thread::Builder::new()
            .name("buffer-flush-picker".to_string())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        PickerCommand::Kick => {
                            let Some(inner) = inner.upgrade() else { break };
                            inner.flush_if_necessary();
                        }
                        PickerCommand::Shutdown => break,
                    }
                }
            });
    }

    /// Registers the closed partition range for `(app_id, shuffle_id)`,
    /// creating an empty buffer on first call. Re-registration keeps the
    /// existing buffer.
    pub fn register_buffer(
        &self,
        app_id: &str,
        shuffle_id: i32,
        range: PartitionRange,
    ) -> StatusCode {
        self.inner.register_buffer(app_id, shuffle_id, range)
    }

    /// Appends client-delivered blocks to the covering partition buffer.
    pub fn cache_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        is_pre_allocated: bool,
        data: PartitionedData,
    ) -> StatusCode {
        self.inner
            .cache_shuffle_data(app_id, shuffle_id, is_pre_allocated, data)
    }

    /// Reads buffered blocks for a partition. `None` when the partition is
    /// not registered here.
    pub fn get_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
        last_block_id: i64,
        read_limit: u64,
        task_filter: Option<&Treemap>,
    ) -> Option<ShuffleDataResult> {
        let (_, buffer) = self
            .inner
            .get_buffer_entry(app_id, shuffle_id, partition_id)?;
        Some(buffer.get_shuffle_data(last_block_id, read_limit, task_filter))
    }

    /// Reserves write memory ahead of a bulk send. Does not block waiting for
    /// space; the caller retries.
    pub fn require_memory(&self, size: u64, is_pre_allocated: bool) -> bool {
        self.inner
            .accountant
            .require_write_memory(size, is_pre_allocated)
    }

    /// Settles a reservation marker after the reserved data arrived,
    /// converting the reserved bytes into live ones.
    pub fn release_pre_allocated_size(&self, size: u64) {
        self.inner.accountant.release_pre_allocated(size);
    }

    /// Returns a reservation whose data never arrived: the bytes leave both
    /// `used` and the pre-allocation marker.
    pub fn release_timed_out_reservation(&self, size: u64) {
        self.inner.accountant.release_memory(size, false, true);
    }

    pub fn require_read_memory(&self, size: u64) -> bool {
        self.inner.accountant.require_read_memory(size)
    }

    pub fn release_read_memory(&self, size: u64) {
        self.inner.accountant.release_read_memory(size);
    }

    /// Force-flushes every partition buffer of the shuffle.
    pub fn commit_shuffle_task(&self, app_id: &str, shuffle_id: i32) -> StatusCode {
        self.inner.commit_shuffle_task(app_id, shuffle_id)
    }

    /// Terminates and releases every buffer of the listed shuffles. The
    /// caller (the task manager) holds the app write lock.
    pub fn remove_buffer_by_shuffle_ids(&self, app_id: &str, shuffle_ids: &[i32]) {
        self.inner.remove_buffer_by_shuffle_ids(app_id, shuffle_ids);
    }

    /// Cascades removal over every shuffle of the app. The caller holds the
    /// app write lock.
    pub fn remove_buffer(&self, app_id: &str) {
        self.inner.remove_buffer(app_id);
    }

    /// Runs one watermark flush round if live memory is above the high
    /// watermark. Only one picker runs at a time; contending callers return
    /// immediately.
    pub fn flush_if_necessary(&self) {
        self.inner.flush_if_necessary();
    }

    pub fn needs_flush(&self) -> bool {
        self.inner.accountant.needs_flush()
    }

    pub fn is_full(&self) -> bool {
        self.inner.accountant.is_full()
    }

    /// Recomputes the watermark pair from new percentages at runtime.
    pub fn set_watermark_percentages(&self, high_pct: f64, low_pct: f64) {
        self.inner
            .accountant
            .set_watermark_percentages(high_pct, low_pct);
    }

    /// Flushes all outstanding buffers, waits for dispatched events to drain
    /// (bounded), then releases everything. New reservations fail from the
    /// moment this is called.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn used_memory(&self) -> u64 {
        self.inner.accountant.used_memory()
    }

    pub fn pre_allocated_size(&self) -> u64 {
        self.inner.accountant.pre_allocated_size()
    }

    pub fn in_flush_size(&self) -> u64 {
        self.inner.accountant.in_flush_size()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.accountant.capacity()
    }

    pub fn read_capacity(&self) -> u64 {
        self.inner.accountant.read_capacity()
    }

    pub fn memory_snapshot(&self) -> MemoryUsageSnapshot {
        self.inner.accountant.snapshot()
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn block_size_snapshot(&self, app_id: &str) -> Option<BlockSizeSnapshot> {
        self.inner.block_size_histograms.snapshot(app_id)
    }

    pub fn allocator_metrics(&self) -> Option<LabMetricsSnapshot> {
        self.inner.allocator.as_ref().map(ChunkAllocator::metrics)
    }

    pub fn huge_partition_size_threshold(&self) -> u64 {
        self.inner.config.huge_partition.size_threshold
    }

    pub fn huge_partition_size_hard_limit(&self) -> u64 {
        self.inner.config.huge_partition.size_hard_limit
    }

    pub fn huge_partition_split_limit(&self) -> u64 {
        self.inner.config.huge_partition.split_limit
    }

    pub fn huge_partition_memory_limit(&self) -> u64 {
        self.inner.config.huge_partition_memory_limit()
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        let _ = self.inner.picker_tx.send(PickerCommand::Shutdown);
    }
}

struct PoolInner {
    config: BufferPoolConfig,
    allocator: Option<ChunkAllocator>,
    accountant: Arc<MemoryAccountant>,
    metrics: Arc<PoolMetrics>,
    block_size_histograms: BlockSizeHistograms,
    /// appId -> shuffleId -> range -> buffer. Outer map keyed by app so
    /// per-app mutation does not contend across apps.
    pool: DashMap<String, ShuffleBufferMap>,
    /// appId -> shuffleId -> buffered bytes; the picker sorts candidates from
    /// this mirror instead of walking every buffer.
    shuffle_sizes: DashMap<String, DashMap<i32, AtomicI64>>,
    task_manager: Arc<dyn TaskManager>,
    dispatcher: Arc<dyn FlushDispatcher>,
    /// One watermark picker at a time.
    scheduler: Mutex<()>,
    event_seq: AtomicU64,
    picker_tx: Sender<PickerCommand>,
}

impl PoolInner {
    fn register_buffer(&self, app_id: &str, shuffle_id: i32, range: PartitionRange) -> StatusCode {
        let app_buffers = self.pool.entry(app_id.to_string()).or_default();
        let ranges = app_buffers
            .entry(shuffle_id)
            .or_insert_with(|| RwLock::new(RangeMap::new()));
        let mut ranges = ranges.write();
        if ranges.get(range.start).is_some() {
            warn!(app_id, shuffle_id, range = %range, "partition range already registered");
            return StatusCode::Success;
        }
        let buffer = Arc::new(PartitionBuffer::new(
            self.config.buffer_type,
            self.allocator.clone(),
        ));
        match ranges.insert(range, buffer) {
            Ok(()) => {
                self.metrics.incr_partitions();
                StatusCode::Success
            }
            Err(err) => {
                warn!(app_id, shuffle_id, error = %err, "rejecting partition registration");
                StatusCode::InternalError
            }
        }
    }

    fn get_buffer_entry(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
    ) -> Option<(PartitionRange, Arc<PartitionBuffer>)> {
        let app_buffers = self.pool.get(app_id)?;
        let ranges = app_buffers.get(&shuffle_id)?;
        let ranges = ranges.read();
        let (range, buffer) = ranges.get(partition_id)?;
        Some((range, Arc::clone(buffer)))
    }

    fn cache_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        is_pre_allocated: bool,
        data: PartitionedData,
    ) -> StatusCode {
        if !is_pre_allocated && self.accountant.is_full() {
            warn!(
                app_id,
                shuffle_id, "got unexpected data, cannot cache it because the space is full"
            );
            return StatusCode::NoBuffer;
        }
        let partition_id = data.partition_id;
        let Some((range, buffer)) = self.get_buffer_entry(app_id, shuffle_id, partition_id) else {
            return StatusCode::NoRegister;
        };
        let block_sizes: Vec<u64> = if self.block_size_histograms.enabled() {
            data.blocks.iter().map(|block| block.data_length()).collect()
        } else {
            Vec::new()
        };
        let block_count = data.blocks.len() as u64;
        match buffer.append(data) {
            AppendOutcome::Evicted => StatusCode::NoRegister,
            AppendOutcome::Appended { charged, replaced } => {
                for size in block_sizes {
                    self.block_size_histograms.record(app_id, size);
                }
                if !is_pre_allocated {
                    self.accountant.update_used_memory(charged as i64);
                }
                if replaced > 0 {
                    // The displaced duplicates were charged by an earlier
                    // append.
                    self.accountant.update_used_memory(-(replaced as i64));
                }
                self.metrics.record_append(block_count, charged);
                self.update_shuffle_size(app_id, shuffle_id, charged as i64 - replaced as i64);
                debug!(
                    app_id,
                    shuffle_id,
                    partition_id,
                    bytes = charged,
                    blocks = block_count,
                    "cache shuffle data"
                );
                self.flush_single_buffer_if_necessary(
                    &buffer,
                    app_id,
                    shuffle_id,
                    partition_id,
                    range,
                );
                if self.config.flush_when_caching_data && self.accountant.needs_flush() {
                    self.kick_picker();
                }
                StatusCode::Success
            }
        }
    }

    fn update_shuffle_size(&self, app_id: &str, shuffle_id: i32, delta: i64) {
        let app_sizes = self.shuffle_sizes.entry(app_id.to_string()).or_default();
        app_sizes
            .entry(shuffle_id)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Coalescing wake-up for the dedicated picker thread; never runs the
    /// picker on the append thread.
    fn kick_picker(&self) {
        let _ = self.picker_tx.try_send(PickerCommand::Kick);
    }

    fn over_single_buffer_thresholds(&self, buffer: &PartitionBuffer) -> bool {
        buffer.encoded_length() > self.config.single_buffer_flush_threshold_bytes
            || buffer.block_count() > self.config.single_buffer_flush_blocks
    }

    fn flush_single_buffer_if_necessary(
        &self,
        buffer: &Arc<PartitionBuffer>,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
        range: PartitionRange,
    ) {
        if !self.over_single_buffer_thresholds(buffer) {
            return;
        }
        let is_huge = self
            .task_manager
            .is_huge_partition(app_id, shuffle_id, partition_id);
        if !(is_huge || self.config.single_buffer_flush_enabled) {
            return;
        }
        let lock = self.task_manager.app_read_lock(app_id);
        let _app_guard = lock.read();
        // Double-check next to the snapshot; a concurrent flush may have
        // drained the buffer since the first test.
        if self.over_single_buffer_thresholds(buffer) {
            debug!(
                app_id,
                shuffle_id,
                start = range.start,
                end = range.end,
                is_huge,
                bytes = buffer.encoded_length(),
                blocks = buffer.block_count(),
                "start to flush single buffer"
            );
            if self.dispatch_flush_locked(buffer, app_id, shuffle_id, range, is_huge) {
                self.metrics.incr_single_buffer_flush();
            }
        }
    }

    fn shuffle_registered(&self, app_id: &str, shuffle_id: i32) -> bool {
        self.pool
            .get(app_id)
            .is_some_and(|app_buffers| app_buffers.contains_key(&shuffle_id))
    }

    /// Snapshots the buffer into a flush event and hands it to the external
    /// flush manager. The caller holds the app read lock.
    fn dispatch_flush_locked(
        &self,
        buffer: &Arc<PartitionBuffer>,
        app_id: &str,
        shuffle_id: i32,
        range: PartitionRange,
        is_huge: bool,
    ) -> bool {
        if !self.shuffle_registered(app_id, shuffle_id) {
            info!(
                app_id,
                shuffle_id, "shuffle already removed, no need to flush the buffer"
            );
            return false;
        }
        let event_id = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let key = ShuffleKey::new(app_id, shuffle_id);
        let distribution = self.dispatcher.data_distribution(app_id);
        let Some(event) = buffer.to_flush_event(&key, range, event_id, distribution, is_huge, || {
            self.shuffle_registered(app_id, shuffle_id)
        }) else {
            return false;
        };
        let encoded_length = event.encoded_length();
        self.accountant.add_in_flush(encoded_length);
        self.update_shuffle_size(app_id, shuffle_id, -(encoded_length as i64));
        let cleanup_buffer = Arc::clone(buffer);
        let accountant = Arc::clone(&self.accountant);
        let metrics = Arc::clone(&self.metrics);
        event.set_cleanup_callback(Box::new(move || {
            cleanup_buffer.clear_in_flush(event_id);
            accountant.release_memory(encoded_length, true, false);
            metrics.incr_flush_completed();
        }));
        self.metrics.incr_flush_dispatched();
        self.dispatcher.add_to_flush_queue(event);
        true
    }

    fn flush_if_necessary(&self) {
        let Some(_scheduler) = self.scheduler.try_lock() else {
            return;
        };
        if !self.accountant.needs_flush() {
            return;
        }
        let snapshot = self.accountant.snapshot();
        info!(
            used = snapshot.used,
            pre_allocated = snapshot.pre_allocated,
            in_flush = snapshot.in_flush,
            "start watermark flush"
        );
        self.metrics.incr_watermark_round();
        let picked = self.pick_flushed_shuffles();
        self.flush_picked(&picked);
    }

    /// Sorts `(app, shuffle)` candidates by buffered size, descending, and
    /// picks until the picked total exceeds `high - low`. Shuffles at or
    /// below the flush threshold are only picked while the total is still
    /// under half the target, which guarantees forward progress when every
    /// shuffle is small.
    fn pick_flushed_shuffles(&self) -> HashMap<String, HashSet<i32>> {
        let mut size_list: Vec<(ShuffleKey, i64)> = Vec::new();
        for app_entry in self.shuffle_sizes.iter() {
            for shuffle_entry in app_entry.value().iter() {
                size_list.push((
                    ShuffleKey::new(app_entry.key().clone(), *shuffle_entry.key()),
                    shuffle_entry.value().load(Ordering::Relaxed),
                ));
            }
        }
        size_list.sort_by(|a, b| b.1.cmp(&a.1));

        let expected = self.accountant.watermarks().spread() as i64;
        let at_least = expected >> 1;
        let mut picked: HashMap<String, HashSet<i32>> = HashMap::new();
        let mut picked_size = 0i64;
        let mut logged = 0usize;
        for (key, size) in size_list {
            if size > self.config.shuffle_flush_threshold as i64 || picked_size <= at_least {
                picked_size += size;
                picked
                    .entry(key.app_id.clone())
                    .or_default()
                    .insert(key.shuffle_id);
                if logged < PICK_LOG_LIMIT {
                    info!(shuffle = %key, bytes = size, "picked shuffle for flush");
                    logged += 1;
                }
                if picked_size > expected {
                    info!(bytes = picked_size, "finished flush pick");
                    break;
                }
            } else {
                // Sorted descending: everything after this is smaller, below
                // the threshold, and enough has been picked already.
                break;
            }
        }
        picked
    }

    fn flush_picked(&self, picked: &HashMap<String, HashSet<i32>>) {
        let expected = self.accountant.watermarks().spread();
        let mut picked_bytes = 0u64;
        for (app_id, shuffle_ids) in picked {
            if self.task_manager.is_app_expired(app_id) {
                continue;
            }
            let lock = self.task_manager.app_read_lock(app_id);
            let Some(_app_guard) = lock.try_read_for(self.config.flush_try_lock_timeout()) else {
                debug!(app_id, "skipping app, read lock not acquired within budget");
                continue;
            };
            let mut targets: Vec<(i32, PartitionRange, Arc<PartitionBuffer>)> = Vec::new();
            if let Some(app_buffers) = self.pool.get(app_id.as_str()) {
                for shuffle_id in shuffle_ids {
                    let Some(ranges) = app_buffers.get(shuffle_id) else {
                        continue;
                    };
                    let ranges = ranges.read();
                    for (range, buffer) in ranges.iter() {
                        targets.push((*shuffle_id, range, Arc::clone(buffer)));
                    }
                }
            }
            for (shuffle_id, range, buffer) in targets {
                picked_bytes += buffer.encoded_length();
                let is_huge = self
                    .task_manager
                    .is_huge_partition(app_id, shuffle_id, range.start);
                self.dispatch_flush_locked(&buffer, app_id, shuffle_id, range, is_huge);
                if picked_bytes > expected {
                    info!(bytes = picked_bytes, "picked enough buffers to flush");
                    return;
                }
            }
        }
    }

    fn commit_shuffle_task(&self, app_id: &str, shuffle_id: i32) -> StatusCode {
        let _scheduler = self.scheduler.lock();
        let mut targets: Vec<(PartitionRange, Arc<PartitionBuffer>)> = Vec::new();
        {
            let Some(app_buffers) = self.pool.get(app_id) else {
                return StatusCode::NoRegister;
            };
            let Some(ranges) = app_buffers.get(&shuffle_id) else {
                return StatusCode::NoRegister;
            };
            let ranges = ranges.read();
            for (range, buffer) in ranges.iter() {
                targets.push((range, Arc::clone(buffer)));
            }
        }
        let lock = self.task_manager.app_read_lock(app_id);
        let _app_guard = lock.read();
        for (range, buffer) in targets {
            let is_huge = self
                .task_manager
                .is_huge_partition(app_id, shuffle_id, range.start);
            self.dispatch_flush_locked(&buffer, app_id, shuffle_id, range, is_huge);
        }
        StatusCode::Success
    }

    fn remove_buffer_by_shuffle_ids(&self, app_id: &str, shuffle_ids: &[i32]) {
        // Detach the range maps before releasing any buffer, so no pool-map
        // guard is held while buffer mutexes are taken (flush dispatch holds
        // a buffer mutex while it re-checks the pool map).
        let mut detached: Vec<(i32, RangeMap<Arc<PartitionBuffer>>)> = Vec::new();
        {
            let Some(app_buffers) = self.pool.get(app_id) else {
                return;
            };
            for shuffle_id in shuffle_ids {
                if let Some((_, ranges)) = app_buffers.remove(shuffle_id) {
                    detached.push((*shuffle_id, ranges.into_inner()));
                }
            }
        }
        for (shuffle_id, ranges) in detached {
            let mut released_bytes = 0u64;
            let mut partitions = 0u64;
            for (_, buffer) in ranges.iter() {
                let released = buffer.release();
                released_bytes += released;
                partitions += 1;
                self.accountant.release_memory(released, false, false);
            }
            self.metrics.decr_partitions(partitions);
            if let Some(app_sizes) = self.shuffle_sizes.get(app_id) {
                app_sizes.remove(&shuffle_id);
            }
            info!(
                app_id,
                shuffle_id,
                bytes = released_bytes,
                partitions,
                "removed shuffle buffers"
            );
        }
    }

    fn remove_buffer(&self, app_id: &str) {
        let shuffle_ids: Vec<i32> = match self.pool.get(app_id) {
            Some(app_buffers) => app_buffers.iter().map(|entry| *entry.key()).collect(),
            None => return,
        };
        self.remove_buffer_by_shuffle_ids(app_id, &shuffle_ids);
        self.pool.remove(app_id);
        self.shuffle_sizes.remove(app_id);
        self.block_size_histograms.remove_app(app_id);
    }

    fn shutdown(&self) {
        info!("shutting down buffer pool, flushing outstanding buffers");
        self.accountant.clamp_capacity_for_shutdown();
        {
            let _scheduler = self.scheduler.lock();
            let apps: Vec<String> = self.pool.iter().map(|entry| entry.key().clone()).collect();
            for app_id in apps {
                let shuffle_ids: Vec<i32> = match self.pool.get(&app_id) {
                    Some(app_buffers) => app_buffers.iter().map(|entry| *entry.key()).collect(),
                    None => continue,
                };
                let lock = self.task_manager.app_read_lock(&app_id);
                let _app_guard = lock.read();
                for shuffle_id in shuffle_ids {
                    let mut targets: Vec<(PartitionRange, Arc<PartitionBuffer>)> = Vec::new();
                    if let Some(app_buffers) = self.pool.get(&app_id) {
                        if let Some(ranges) = app_buffers.get(&shuffle_id) {
                            let ranges = ranges.read();
                            for (range, buffer) in ranges.iter() {
                                targets.push((range, Arc::clone(buffer)));
                            }
                        }
                    }
                    for (range, buffer) in targets {
                        let is_huge = self
                            .task_manager
                            .is_huge_partition(&app_id, shuffle_id, range.start);
                        self.dispatch_flush_locked(&buffer, &app_id, shuffle_id, range, is_huge);
                    }
                }
            }
        }
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.accountant.in_flush_size() > 0 && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_DRAIN_POLL);
        }
        let undrained = self.accountant.in_flush_size();
        if undrained > 0 {
            warn!(bytes = undrained, "in-flush data did not drain before the shutdown deadline");
        }
        let apps: Vec<String> = self.pool.iter().map(|entry| entry.key().clone()).collect();
        for app_id in apps {
            self.remove_buffer(&app_id);
        }
        info!(
            used = self.accountant.used_memory(),
            "buffer pool shutdown complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferType;
    use crate::test_support::{raw_blocks, CollectingDispatcher, TestTaskManager};

    fn pool_with(
        capacity: u64,
        mutate: impl FnOnce(&mut BufferPoolConfig),
    ) -> (BufferPoolManager, Arc<CollectingDispatcher>, Arc<TestTaskManager>) {
        let mut config = BufferPoolConfig {
            capacity,
            read_capacity: capacity,
            ..BufferPoolConfig::default()
        };
        mutate(&mut config);
        let task_manager = Arc::new(TestTaskManager::default());
        let dispatcher = Arc::new(CollectingDispatcher::default());
        let manager = BufferPoolManager::new(
            config,
            Arc::clone(&task_manager) as Arc<dyn TaskManager>,
            Arc::clone(&dispatcher) as Arc<dyn FlushDispatcher>,
        )
        .expect("pool");
        (manager, dispatcher, task_manager)
    }

    fn pool(capacity: u64) -> (BufferPoolManager, Arc<CollectingDispatcher>, Arc<TestTaskManager>) {
        pool_with(capacity, |_| {})
    }

    #[test]
    fn register_is_idempotent() {
        let (pool, _, _) = pool(1024);
        assert_eq!(
            pool.register_buffer("app-1", 0, PartitionRange::new(0, 3)),
            StatusCode::Success
        );
        assert_eq!(
            pool.register_buffer("app-1", 0, PartitionRange::new(0, 3)),
            StatusCode::Success
        );
        assert_eq!(pool.metrics_snapshot().active_partitions, 1);
    }

    #[test]
    fn cache_requires_registration() {
        let (pool, _, _) = pool(1024);
        let status = pool.cache_shuffle_data("app-1", 0, false, raw_blocks(7, 1, 1, 16));
        assert_eq!(status, StatusCode::NoRegister);
    }

    #[test]
    fn cache_accounts_memory() {
        let (pool, _, _) = pool(1024);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        let status = pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 2, 32));
        assert_eq!(status, StatusCode::Success);
        assert_eq!(pool.used_memory(), 64);
        let snapshot = pool.metrics_snapshot();
        assert_eq!(snapshot.appended_blocks, 2);
        assert_eq!(snapshot.appended_bytes, 64);
    }

    #[test]
    fn full_pool_refuses_unreserved_data() {
        let (pool, _, _) = pool(100);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        assert!(pool.require_memory(100, false));
        let status = pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 1, 10));
        assert_eq!(status, StatusCode::NoBuffer);
    }

    #[test]
    fn commit_flushes_every_range_of_the_shuffle() {
        let (pool, dispatcher, _) = pool(4096);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        pool.register_buffer("app-1", 0, PartitionRange::new(1, 1));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 2, 10));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(1, 10, 3, 10));

        assert_eq!(pool.commit_shuffle_task("app-1", 0), StatusCode::Success);
        let events = dispatcher.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(pool.in_flush_size(), 50);
        for event in &events {
            event.complete();
        }
        assert_eq!(pool.in_flush_size(), 0);
        assert_eq!(pool.used_memory(), 0);
    }

    #[test]
    fn commit_unknown_shuffle_is_no_register() {
        let (pool, _, _) = pool(1024);
        assert_eq!(pool.commit_shuffle_task("app-1", 0), StatusCode::NoRegister);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        assert_eq!(pool.commit_shuffle_task("app-1", 9), StatusCode::NoRegister);
    }

    #[test]
    fn skip_list_pool_serves_ordered_reads() {
        let (pool, _, _) = pool_with(4096, |config| {
            config.buffer_type = BufferType::SkipList;
        });
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 5, 3, 8));
        let result = pool
            .get_shuffle_data("app-1", 0, 0, crate::block::INVALID_BLOCK_ID, 1024, None)
            .expect("registered");
        assert_eq!(result.segments.len(), 3);
    }

    #[test]
    fn removed_shuffles_reject_further_appends() {
        let (pool, _, _) = pool(1024);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 1, 40));
        assert_eq!(pool.used_memory(), 40);

        pool.remove_buffer_by_shuffle_ids("app-1", &[0]);
        assert_eq!(pool.used_memory(), 0);
        let status = pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 2, 1, 8));
        assert_eq!(status, StatusCode::NoRegister);
    }

    #[test]
    fn app_block_size_histogram_lives_and_dies_with_the_app() {
        let (pool, _, _) = pool_with(4096, |config| {
            config.app_block_size_metric_enabled = true;
        });
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 3, 64));
        let snapshot = pool.block_size_snapshot("app-1").expect("histogram");
        assert_eq!(snapshot.count, 3);
        assert!(snapshot.max >= 63);

        pool.remove_buffer("app-1");
        assert!(pool.block_size_snapshot("app-1").is_none());
    }

    #[test]
    fn shuffle_size_index_tracks_appends_and_dispatch() {
        let (pool, dispatcher, _) = pool(4096);
        pool.register_buffer("app-1", 0, PartitionRange::new(0, 0));
        pool.cache_shuffle_data("app-1", 0, false, raw_blocks(0, 1, 4, 25));
        let sizes = &pool.inner.shuffle_sizes;
        assert_eq!(
            sizes.get("app-1").unwrap().get(&0).unwrap().load(Ordering::Relaxed),
            100
        );
        pool.commit_shuffle_task("app-1", 0);
        assert_eq!(
            sizes.get("app-1").unwrap().get(&0).unwrap().load(Ordering::Relaxed),
            0
        );
        dispatcher.drain();
    }
}
