//! In-process collaborator implementations for exercising the pool in unit
//! and integration tests.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::block::{Block, BlockData, PartitionedData};
use crate::flush::{DataDistribution, FlushDispatcher, FlushEvent, TaskManager};

/// Task manager backed by plain in-process maps: every app gets a lock on
/// demand, and tests flip expiry / huge-partition verdicts directly.
#[derive(Default)]
pub struct TestTaskManager {
    locks: DashMap<String, Arc<RwLock<()>>>,
    expired: Mutex<HashSet<String>>,
    huge: Mutex<HashSet<(String, i32, i32)>>,
}

impl TestTaskManager {
    pub fn mark_expired(&self, app_id: &str) {
        self.expired.lock().insert(app_id.to_string());
    }

    pub fn mark_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) {
        self.huge
            .lock()
            .insert((app_id.to_string(), shuffle_id, partition_id));
    }
}

impl TaskManager for TestTaskManager {
    fn app_read_lock(&self, app_id: &str) -> Arc<RwLock<()>> {
        Arc::clone(
            &self
                .locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    fn is_app_expired(&self, app_id: &str) -> bool {
        self.expired.lock().contains(app_id)
    }

    fn is_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) -> bool {
        self.huge
            .lock()
            .contains(&(app_id.to_string(), shuffle_id, partition_id))
    }
}

/// Flush dispatcher that parks every event on a channel for the test to
/// inspect, complete, or drop (dropping completes an event too).
pub struct CollectingDispatcher {
    tx: Sender<FlushEvent>,
    rx: Receiver<FlushEvent>,
    distribution: DataDistribution,
    /// Completes each event at enqueue time, standing in for an immediately
    /// successful flusher.
    auto_complete: bool,
}

impl Default for CollectingDispatcher {
    fn default() -> Self {
        Self::new(false)
    }
}

impl CollectingDispatcher {
    pub fn new(auto_complete: bool) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            distribution: DataDistribution::Normal,
            auto_complete,
        }
    }

    pub fn with_distribution(mut self, distribution: DataDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Takes every event dispatched so far.
    pub fn drain(&self) -> Vec<FlushEvent> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl FlushDispatcher for CollectingDispatcher {
    fn add_to_flush_queue(&self, event: FlushEvent) {
        if self.auto_complete {
            event.complete();
        }
        let _ = self.tx.send(event);
    }

    fn data_distribution(&self, _app_id: &str) -> DataDistribution {
        self.distribution
    }
}

/// Builds one delivery of `count` blocks of `block_len` bytes each, with
/// consecutive block ids starting at `start_block_id`.
pub fn raw_blocks(
    partition_id: i32,
    start_block_id: i64,
    count: usize,
    block_len: usize,
) -> PartitionedData {
    let blocks = (0..count)
        .map(|idx| {
            let block_id = start_block_id + idx as i64;
            Block {
                block_id,
                task_attempt_id: 0,
                seq_no: block_id,
                uncompressed_length: block_len as i32,
                crc: 0,
                data: BlockData::Raw(Bytes::from(vec![block_id as u8; block_len])),
            }
        })
        .collect();
    PartitionedData::new(partition_id, blocks)
}
