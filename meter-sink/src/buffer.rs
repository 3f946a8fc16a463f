//! Dedup Buffer - holds not-yet-flushed messages keyed by log coordinate
//!
//! Redelivery of the same coordinate (e.g. after a consumer restart before the
//! offset was committed) overwrites the previous entry instead of accumulating.
//! The buffer is drained as a single atomic take-all so the flush never sees a
//! half-drained state.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::types::{LogCoordinate, Partition, SinkMessage};

#[derive(Default)]
pub struct SinkBuffer {
    entries: Mutex<AHashMap<LogCoordinate, SinkMessage>>,
}

impl SinkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry at the message's coordinate.
    pub fn add(&self, message: SinkMessage) {
        self.entries
            .lock()
            .insert(message.coordinate.clone(), message);
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every buffered message, leaving the buffer empty. Order is unspecified.
    pub fn dequeue(&self) -> Vec<SinkMessage> {
        let drained = std::mem::take(&mut *self.entries.lock());
        drained.into_iter().map(|(_, message)| message).collect()
    }

    /// Drop every entry belonging to one of `partitions`. Returns how many were removed.
    pub fn remove_by_partitions(&self, partitions: &[Partition]) -> usize {
        if partitions.is_empty() {
            return 0;
        }

        let revoked: AHashSet<&Partition> = partitions.iter().collect();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|coordinate, _| !revoked.contains(coordinate.partition()));
        before - entries.len()
    }
}
