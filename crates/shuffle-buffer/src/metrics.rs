use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tracing::warn;

/// Point-in-time snapshot of pool-wide counters and gauges.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolMetricsSnapshot {
    pub used_bytes: u64,
    pub pre_allocated_bytes: u64,
    pub in_flush_bytes: u64,
    pub read_used_bytes: u64,
    pub active_partitions: u64,
    pub total_partitions: u64,
    pub appended_blocks: u64,
    pub appended_bytes: u64,
    pub flush_events_dispatched: u64,
    pub flush_events_completed: u64,
    pub single_buffer_flushes: u64,
    pub watermark_flush_rounds: u64,
    pub require_write_failures: u64,
    pub require_read_total: u64,
    pub require_read_failures: u64,
}

/// Thread-safe pool metrics. Gauges mirror the accountant's counters; the
/// rest are monotonic counters. All operations are lock-free.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    used_bytes: AtomicU64,
    pre_allocated_bytes: AtomicU64,
    in_flush_bytes: AtomicU64,
    read_used_bytes: AtomicU64,
    active_partitions: AtomicU64,
    total_partitions: AtomicU64,
    appended_blocks: AtomicU64,
    appended_bytes: AtomicU64,
    flush_events_dispatched: AtomicU64,
    flush_events_completed: AtomicU64,
    single_buffer_flushes: AtomicU64,
    watermark_flush_rounds: AtomicU64,
    require_write_failures: AtomicU64,
    require_read_total: AtomicU64,
    require_read_failures: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn set_used_bytes(&self, bytes: u64) {
        self.used_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_pre_allocated_bytes(&self, bytes: u64) {
        self.pre_allocated_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_in_flush_bytes(&self, bytes: u64) {
        self.in_flush_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_read_used_bytes(&self, bytes: u64) {
        self.read_used_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn incr_partitions(&self) {
        self.active_partitions.fetch_add(1, Ordering::Relaxed);
        self.total_partitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr_partitions(&self, count: u64) {
        let mut current = self.active_partitions.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.active_partitions.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn record_append(&self, blocks: u64, bytes: u64) {
        self.appended_blocks.fetch_add(blocks, Ordering::Relaxed);
        self.appended_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn incr_flush_dispatched(&self) {
        self.flush_events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_flush_completed(&self) {
        self.flush_events_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_single_buffer_flush(&self) {
        self.single_buffer_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_watermark_round(&self) {
        self.watermark_flush_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_require_write_failure(&self) {
        self.require_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_require_read(&self) {
        self.require_read_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_require_read_failure(&self) {
        self.require_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            pre_allocated_bytes: self.pre_allocated_bytes.load(Ordering::Relaxed),
            in_flush_bytes: self.in_flush_bytes.load(Ordering::Relaxed),
            read_used_bytes: self.read_used_bytes.load(Ordering::Relaxed),
            active_partitions: self.active_partitions.load(Ordering::Relaxed),
            total_partitions: self.total_partitions.load(Ordering::Relaxed),
            appended_blocks: self.appended_blocks.load(Ordering::Relaxed),
            appended_bytes: self.appended_bytes.load(Ordering::Relaxed),
            flush_events_dispatched: self.flush_events_dispatched.load(Ordering::Relaxed),
            flush_events_completed: self.flush_events_completed.load(Ordering::Relaxed),
            single_buffer_flushes: self.single_buffer_flushes.load(Ordering::Relaxed),
            watermark_flush_rounds: self.watermark_flush_rounds.load(Ordering::Relaxed),
            require_write_failures: self.require_write_failures.load(Ordering::Relaxed),
            require_read_total: self.require_read_total.load(Ordering::Relaxed),
            require_read_failures: self.require_read_failures.load(Ordering::Relaxed),
        }
    }
}

/// Summary of one app's write-block-size distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeSnapshot {
    pub count: u64,
    pub p50: u64,
    pub p99: u64,
    pub max: u64,
}

/// Per-app histograms of written block sizes. Disabled by default; when
/// disabled every operation is a no-op.
#[derive(Debug)]
pub struct BlockSizeHistograms {
    enabled: bool,
    histograms: Mutex<HashMap<String, Histogram<u64>>>,
}

impl BlockSizeHistograms {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            histograms: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn record(&self, app_id: &str, block_size: u64) {
        if !self.enabled {
            return;
        }
        let mut histograms = self.histograms.lock();
        let histogram = histograms.entry(app_id.to_string()).or_insert_with(|| {
            Histogram::new(3).expect("3 significant digits is a valid histogram sigfig")
        });
        if histogram.record(block_size.max(1)).is_err() {
            warn!(app_id, block_size, "block size exceeds histogram range");
        }
    }

    pub(crate) fn remove_app(&self, app_id: &str) {
        if !self.enabled {
            return;
        }
        self.histograms.lock().remove(app_id);
    }

    pub fn snapshot(&self, app_id: &str) -> Option<BlockSizeSnapshot> {
        if !self.enabled {
            return None;
        }
        let histograms = self.histograms.lock();
        let histogram = histograms.get(app_id)?;
        Some(BlockSizeSnapshot {
            count: histogram.len(),
            p50: histogram.value_at_quantile(0.5),
            p99: histogram.value_at_quantile(0.99),
            max: histogram.max(),
        })
    }
}
