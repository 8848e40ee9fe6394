use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::block::Block;
use crate::range_map::PartitionRange;

/// How the external flush manager lays out a shuffle's data on storage.
/// Affects only event payload construction here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDistribution {
    Normal,
    LocalOrder,
}

impl Default for DataDistribution {
    fn default() -> Self {
        Self::Normal
    }
}

/// One batch of blocks snapshotted out of a partition buffer, bound for
/// persistent storage.
///
/// The pool installs a cleanup callback before dispatch; the flush manager
/// must invoke [`FlushEvent::complete`] exactly once when the flush finishes,
/// successfully or not — completion is what returns the event's bytes to the
/// pool. Completion is idempotent: a second call (or the drop safety net) is
/// a no-op.
pub struct FlushEvent {
    event_id: u64,
    app_id: String,
    shuffle_id: i32,
    range: PartitionRange,
    blocks: Vec<Block>,
    encoded_length: u64,
    is_huge_partition: bool,
    distribution: DataDistribution,
    completed: AtomicBool,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FlushEvent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        event_id: u64,
        app_id: String,
        shuffle_id: i32,
        range: PartitionRange,
        blocks: Vec<Block>,
        encoded_length: u64,
        is_huge_partition: bool,
        distribution: DataDistribution,
    ) -> Self {
        Self {
            event_id,
            app_id,
            shuffle_id,
            range,
            blocks,
            encoded_length,
            is_huge_partition,
            distribution,
            completed: AtomicBool::new(false),
            cleanup: Mutex::new(None),
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn shuffle_id(&self) -> i32 {
        self.shuffle_id
    }

    pub fn range(&self) -> PartitionRange {
        self.range
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn encoded_length(&self) -> u64 {
        self.encoded_length
    }

    pub fn is_huge_partition(&self) -> bool {
        self.is_huge_partition
    }

    pub fn distribution(&self) -> DataDistribution {
        self.distribution
    }

    pub(crate) fn set_cleanup_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        *self.cleanup.lock() = Some(callback);
    }

    /// Finishes the event, releasing its memory back to the pool. Returns
    /// whether this call performed the release (at most one does).
    pub fn complete(&self) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(callback) = self.cleanup.lock().take() {
            callback();
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl Drop for FlushEvent {
    fn drop(&mut self) {
        // A dropped event must not strand its bytes in the in-flush state.
        self.complete();
    }
}

impl fmt::Debug for FlushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushEvent")
            .field("event_id", &self.event_id)
            .field("app_id", &self.app_id)
            .field("shuffle_id", &self.shuffle_id)
            .field("range", &self.range)
            .field("blocks", &self.blocks.len())
            .field("encoded_length", &self.encoded_length)
            .field("is_huge_partition", &self.is_huge_partition)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The external flush manager as seen by the pool: a non-blocking event sink.
/// Backpressure is exercised through the pool's memory counters, not through
/// this call.
pub trait FlushDispatcher: Send + Sync {
    fn add_to_flush_queue(&self, event: FlushEvent);

    /// Storage layout for the app's data; stamped onto each event.
    fn data_distribution(&self, _app_id: &str) -> DataDistribution {
        DataDistribution::Normal
    }
}

/// The external task manager as seen by the pool: per-app lifecycle and the
/// huge-partition verdict.
///
/// The read half of the app lock is held during append and flush dispatch;
/// the task manager holds the write half while removing an app, which is what
/// serializes removal against in-progress flushes. The lock is not reentrant;
/// the pool acquires it at most once per call path.
pub trait TaskManager: Send + Sync {
    fn app_read_lock(&self, app_id: &str) -> Arc<RwLock<()>>;

    fn is_app_expired(&self, app_id: &str) -> bool;

    fn is_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn event() -> FlushEvent {
        FlushEvent::new(
            1,
            "app-1".to_string(),
            0,
            PartitionRange::new(0, 1),
            Vec::new(),
            128,
            false,
            DataDistribution::Normal,
        )
    }

    #[test]
    fn completion_runs_cleanup_once() {
        let runs = Arc::new(AtomicU64::new(0));
        let event = event();
        let counter = Arc::clone(&runs);
        event.set_cleanup_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(event.complete());
        assert!(!event.complete());
        drop(event);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_completes_unfinished_events() {
        let runs = Arc::new(AtomicU64::new(0));
        {
            let event = event();
            let counter = Arc::clone(&runs);
            event.set_cleanup_callback(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
