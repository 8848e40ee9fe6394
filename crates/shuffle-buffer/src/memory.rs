//! Memory accounting for the buffer pool.
//!
//! Four counters gatekeep all capacity admission: `used` (every byte charged
//! to the pool, reservations included), `pre_allocated` (reserved but not yet
//! delivered), `in_flush` (snapshotted into a flush event, awaiting the
//! completion callback), and `read_used` (the independent read-side budget).
//! The watermark comparisons run against *live* memory,
//! `used - pre_allocated - in_flush`: subtracting reservations keeps the
//! flush trigger from double-counting bytes a client has reserved but not
//! yet delivered, and subtracting in-flush keeps already-dispatched bytes
//! from re-triggering the picker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::metrics::PoolMetrics;

/// Self-consistent watermark pair in bytes. Swapped as one record so readers
/// never observe a half-updated pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: u64,
    pub low: u64,
}

impl Watermarks {
    fn from_percentages(capacity: u64, high_pct: f64, low_pct: f64) -> Self {
        Self {
            high: (capacity as f64 / 100.0 * high_pct) as u64,
            low: (capacity as f64 / 100.0 * low_pct) as u64,
        }
    }

    /// Bytes a watermark flush round aims to put in flight.
    pub fn spread(&self) -> u64 {
        self.high.saturating_sub(self.low)
    }
}

/// Point-in-time view of every accountant counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsageSnapshot {
    pub capacity: u64,
    pub read_capacity: u64,
    pub used: u64,
    pub pre_allocated: u64,
    pub in_flush: u64,
    pub read_used: u64,
    pub watermarks: Watermarks,
}

/// The pool's capacity gatekeeper. All counters are atomics with
/// clamp-at-zero underflow handling; accounting drift is logged and repaired,
/// never fatal.
pub struct MemoryAccountant {
    /// Atomic so shutdown can clamp it to zero, failing in-flight
    /// reservations.
    capacity: AtomicU64,
    read_capacity: u64,
    used: AtomicU64,
    pre_allocated: AtomicU64,
    in_flush: AtomicU64,
    read_used: AtomicU64,
    watermarks: ArcSwap<Watermarks>,
    metrics: Arc<PoolMetrics>,
}

impl MemoryAccountant {
    pub fn new(
        capacity: u64,
        read_capacity: u64,
        high_watermark_pct: f64,
        low_watermark_pct: f64,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let watermarks =
            Watermarks::from_percentages(capacity, high_watermark_pct, low_watermark_pct);
        Self {
            capacity: AtomicU64::new(capacity),
            read_capacity,
            used: AtomicU64::new(0),
            pre_allocated: AtomicU64::new(0),
            in_flush: AtomicU64::new(0),
            read_used: AtomicU64::new(0),
            watermarks: ArcSwap::from_pointee(watermarks),
            metrics,
        }
    }

    /// Admits `size` bytes against the write budget. Atomic across the
    /// capacity check and the charge; on contention the loop retries with the
    /// observed value. Does not wait for memory to free up.
    pub fn require_write_memory(&self, size: u64, is_pre_allocated: bool) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let capacity = self.capacity.load(Ordering::Acquire);
            if capacity.saturating_sub(current) < size {
                debug!(
                    size,
                    used = current,
                    pre_allocated = self.pre_allocated.load(Ordering::Relaxed),
                    in_flush = self.in_flush.load(Ordering::Relaxed),
                    "require memory failed"
                );
                self.metrics.incr_require_write_failure();
                return false;
            }
            match self.used.compare_exchange(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.metrics.set_used_bytes(self.used.load(Ordering::Relaxed));
        if is_pre_allocated {
            self.pre_allocated.fetch_add(size, Ordering::AcqRel);
            self.metrics
                .set_pre_allocated_bytes(self.pre_allocated.load(Ordering::Relaxed));
        }
        true
    }

    /// Unconditional signed adjustment of `used`, for the retroactive
    /// accounting of appends that were not pre-allocated.
    pub fn update_used_memory(&self, delta: i64) {
        if delta >= 0 {
            self.used.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            sub_clamped(&self.used, delta.unsigned_abs(), "used memory");
        }
        self.metrics.set_used_bytes(self.used.load(Ordering::Relaxed));
    }

    /// Returns `size` bytes to the pool. `release_in_flush` additionally
    /// settles the in-flush counter (flush-event completion);
    /// `release_pre_allocation` settles the reservation counter (append of
    /// pre-allocated data, or reservation timeout).
    pub fn release_memory(&self, size: u64, release_in_flush: bool, release_pre_allocation: bool) {
        sub_clamped(&self.used, size, "used memory");
        self.metrics.set_used_bytes(self.used.load(Ordering::Relaxed));
        if release_in_flush {
            sub_clamped(&self.in_flush, size, "in-flush memory");
            self.metrics
                .set_in_flush_bytes(self.in_flush.load(Ordering::Relaxed));
        }
        if release_pre_allocation {
            self.release_pre_allocated(size);
        }
    }

    /// Marks `size` bytes as dispatched into a flush event.
    pub fn add_in_flush(&self, size: u64) {
        self.in_flush.fetch_add(size, Ordering::AcqRel);
        self.metrics
            .set_in_flush_bytes(self.in_flush.load(Ordering::Relaxed));
    }

    /// Settles a reservation without touching `used`; the timed-out
    /// reservation path.
    pub fn release_pre_allocated(&self, size: u64) {
        sub_clamped(&self.pre_allocated, size, "pre-allocated memory");
        self.metrics
            .set_pre_allocated_bytes(self.pre_allocated.load(Ordering::Relaxed));
    }

    /// Admits `size` bytes against the read budget, independent from the
    /// write side.
    pub fn require_read_memory(&self, size: u64) -> bool {
        self.metrics.incr_require_read();
        let mut current = self.read_used.load(Ordering::Acquire);
        loop {
            let next = current + size;
            if next >= self.read_capacity {
                warn!(
                    size,
                    read_used = current,
                    read_capacity = self.read_capacity,
                    "cannot admit read memory"
                );
                self.metrics.incr_require_read_failure();
                return false;
            }
            match self.read_used.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.metrics
                        .set_read_used_bytes(self.read_used.load(Ordering::Relaxed));
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_read_memory(&self, size: u64) {
        sub_clamped(&self.read_used, size, "read memory");
        self.metrics
            .set_read_used_bytes(self.read_used.load(Ordering::Relaxed));
    }

    /// Committed-but-not-dispatched bytes; the quantity the watermarks
    /// govern.
    pub fn live_memory(&self) -> u64 {
        let used = self.used.load(Ordering::Acquire);
        let reserved = self.pre_allocated.load(Ordering::Acquire);
        let in_flush = self.in_flush.load(Ordering::Acquire);
        used.saturating_sub(reserved).saturating_sub(in_flush)
    }

    pub fn needs_flush(&self) -> bool {
        self.live_memory() > self.watermarks().high
    }

    pub fn is_full(&self) -> bool {
        self.used.load(Ordering::Acquire) >= self.capacity.load(Ordering::Acquire)
    }

    pub fn watermarks(&self) -> Watermarks {
        **self.watermarks.load()
    }

    /// Recomputes the watermark pair from new percentages. Readers observe
    /// either the old pair or the new one, never a mix.
    pub fn set_watermark_percentages(&self, high_pct: f64, low_pct: f64) {
        let capacity = self.capacity.load(Ordering::Acquire);
        let watermarks = Watermarks::from_percentages(capacity, high_pct, low_pct);
        self.watermarks.store(Arc::new(watermarks));
        debug!(high = watermarks.high, low = watermarks.low, "watermarks updated");
    }

    /// Drops the write capacity to zero so every in-flight reservation fails;
    /// part of pool shutdown.
    pub fn clamp_capacity_for_shutdown(&self) {
        self.capacity.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn read_capacity(&self) -> u64 {
        self.read_capacity
    }

    pub fn used_memory(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn pre_allocated_size(&self) -> u64 {
        self.pre_allocated.load(Ordering::Acquire)
    }

    pub fn in_flush_size(&self) -> u64 {
        self.in_flush.load(Ordering::Acquire)
    }

    pub fn read_used(&self) -> u64 {
        self.read_used.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MemoryUsageSnapshot {
        MemoryUsageSnapshot {
            capacity: self.capacity.load(Ordering::Acquire),
            read_capacity: self.read_capacity,
            used: self.used.load(Ordering::Acquire),
            pre_allocated: self.pre_allocated.load(Ordering::Acquire),
            in_flush: self.in_flush.load(Ordering::Acquire),
            read_used: self.read_used.load(Ordering::Acquire),
            watermarks: self.watermarks(),
        }
    }
}

/// CAS-safe `counter -= size` that clamps at zero. Underflow means
/// accounting drift somewhere upstream; it is repaired and logged, never
/// propagated.
fn sub_clamped(counter: &AtomicU64, size: u64, what: &str) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = if current >= size {
            current - size
        } else {
            warn!(
                current,
                released = size,
                "{what} underflow, clamping to zero"
            );
            0
        };
        match counter.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(capacity: u64) -> MemoryAccountant {
        MemoryAccountant::new(capacity, 1024, 75.0, 25.0, Arc::new(PoolMetrics::default()))
    }

    #[test]
    fn require_respects_capacity() {
        let accountant = accountant(100);
        assert!(accountant.require_write_memory(60, false));
        assert!(accountant.require_write_memory(40, false));
        assert!(!accountant.require_write_memory(1, false));
        assert!(accountant.is_full());
    }

    #[test]
    fn pre_allocation_is_excluded_from_live() {
        let accountant = accountant(1000);
        assert!(accountant.require_write_memory(400, true));
        assert_eq!(accountant.used_memory(), 400);
        assert_eq!(accountant.pre_allocated_size(), 400);
        assert_eq!(accountant.live_memory(), 0);
        // The delivery converts the reservation into live bytes.
        accountant.release_pre_allocated(400);
        assert_eq!(accountant.live_memory(), 400);
    }

    #[test]
    fn release_clamps_at_zero() {
        let accountant = accountant(100);
        assert!(accountant.require_write_memory(10, false));
        accountant.release_memory(50, false, false);
        assert_eq!(accountant.used_memory(), 0);
        accountant.release_pre_allocated(5);
        assert_eq!(accountant.pre_allocated_size(), 0);
    }

    #[test]
    fn in_flush_tracking() {
        let accountant = accountant(1000);
        assert!(accountant.require_write_memory(300, false));
        accountant.add_in_flush(300);
        assert_eq!(accountant.live_memory(), 0);
        accountant.release_memory(300, true, false);
        assert_eq!(accountant.used_memory(), 0);
        assert_eq!(accountant.in_flush_size(), 0);
    }

    #[test]
    fn needs_flush_follows_live_memory() {
        let accountant = accountant(1000);
        assert_eq!(accountant.watermarks(), Watermarks { high: 750, low: 250 });
        assert!(accountant.require_write_memory(800, false));
        assert!(accountant.needs_flush());
        accountant.add_in_flush(500);
        assert!(!accountant.needs_flush());
    }

    #[test]
    fn watermark_reconfiguration_is_atomic_pairwise() {
        let accountant = accountant(1000);
        accountant.set_watermark_percentages(50.0, 10.0);
        assert_eq!(accountant.watermarks(), Watermarks { high: 500, low: 100 });
        assert_eq!(accountant.watermarks().spread(), 400);
    }

    #[test]
    fn read_budget_is_independent() {
        let accountant = accountant(100);
        assert!(accountant.require_write_memory(100, false));
        // Write exhaustion does not affect the read side.
        assert!(accountant.require_read_memory(512));
        // Admission requires staying strictly under the read capacity.
        assert!(!accountant.require_read_memory(512));
        accountant.release_read_memory(512);
        assert_eq!(accountant.read_used(), 0);
    }

    #[test]
    fn shutdown_clamp_fails_new_reservations() {
        let accountant = accountant(1000);
        assert!(accountant.require_write_memory(10, false));
        accountant.clamp_capacity_for_shutdown();
        assert!(!accountant.require_write_memory(1, false));
        assert!(accountant.is_full());
    }

    #[test]
    fn update_used_memory_signed() {
        let accountant = accountant(1000);
        accountant.update_used_memory(200);
        assert_eq!(accountant.used_memory(), 200);
        accountant.update_used_memory(-150);
        assert_eq!(accountant.used_memory(), 50);
        accountant.update_used_memory(-100);
        assert_eq!(accountant.used_memory(), 0);
    }
}
