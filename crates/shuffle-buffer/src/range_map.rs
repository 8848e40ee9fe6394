use std::fmt::{self, Display};

/// Closed partition-id interval `[start, end]` owned by one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionRange {
    pub start: i32,
    pub end: i32,
}

impl PartitionRange {
    pub fn new(start: i32, end: i32) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    pub fn contains(&self, partition_id: i32) -> bool {
        self.start <= partition_id && partition_id <= self.end
    }

    fn overlaps(&self, other: &PartitionRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Attempted insert of a range that intersects an already registered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("range {attempted} overlaps registered range {existing}")]
pub struct RangeOverlap {
    pub attempted: PartitionRange,
    pub existing: PartitionRange,
}

/// Map from disjoint closed integer ranges to values, looked up by a single
/// partition id. Kept as a vector sorted by lower endpoint with binary
/// search; ranges never split after creation.
#[derive(Debug, Default)]
pub struct RangeMap<V> {
    entries: Vec<(PartitionRange, V)>,
}

impl<V> RangeMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `range`. Partition assignments come from the coordinator
    /// with disjoint ranges; an overlap is rejected, not repaired.
    pub fn insert(&mut self, range: PartitionRange, value: V) -> Result<(), RangeOverlap> {
        let idx = self
            .entries
            .partition_point(|(existing, _)| existing.start < range.start);
        if let Some(prev) = idx.checked_sub(1) {
            let existing = self.entries[prev].0;
            if existing.overlaps(&range) {
                return Err(RangeOverlap {
                    attempted: range,
                    existing,
                });
            }
        }
        if let Some((existing, _)) = self.entries.get(idx) {
            if existing.overlaps(&range) {
                return Err(RangeOverlap {
                    attempted: range,
                    existing: *existing,
                });
            }
        }
        self.entries.insert(idx, (range, value));
        Ok(())
    }

    /// Looks up the entry whose range covers `partition_id`.
    pub fn get(&self, partition_id: i32) -> Option<(PartitionRange, &V)> {
        let idx = self
            .entries
            .partition_point(|(range, _)| range.start <= partition_id);
        let (range, value) = self.entries.get(idx.checked_sub(1)?)?;
        range.contains(partition_id).then_some((*range, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionRange, &V)> {
        self.entries.iter().map(|(range, value)| (*range, value))
    }
}
