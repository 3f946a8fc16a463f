use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::SinkBuffer;
use crate::kafka::LogClient;
use crate::metrics_consts::REBALANCE_PURGED_MESSAGES;
use crate::types::Partition;

/// Forget the buffered messages of revoked partitions. Their offsets were
/// never committed, so the next owner reads them again.
///
/// Called from the consumer's revoke callback before the partitions leave
/// this member, and again when the loop applies the revocation.
pub fn purge_revoked(buffer: &SinkBuffer, partitions: &[Partition]) -> usize {
    let purged = buffer.remove_by_partitions(partitions);
    if purged > 0 {
        metrics::counter!(REBALANCE_PURGED_MESSAGES).increment(purged as u64);
    }
    purged
}

/// Applies partition assignment changes to the consumer and the buffer.
/// Callers hold the sink lock, so a rebalance never interleaves with a flush.
pub struct PartitionRebalancer {
    log: Arc<dyn LogClient>,
    buffer: Arc<SinkBuffer>,
}

impl PartitionRebalancer {
    pub fn new(log: Arc<dyn LogClient>, buffer: Arc<SinkBuffer>) -> Self {
        Self { log, buffer }
    }

    /// Resume the whole current assignment. Newly assigned partitions start
    /// from their committed offset, or the reset policy when there is none.
    pub fn on_assigned(&self, partitions: &[Partition]) {
        info!(assigned = partitions.len(), "partitions assigned");

        let assignment = match self.log.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!("failed to read assignment, resuming assigned partitions only: {e}");
                partitions.to_vec()
            }
        };

        if let Err(e) = self.log.resume(&assignment) {
            warn!(partitions = assignment.len(), "failed to resume partitions: {e}");
        }
    }

    /// Pause the revoked partitions and forget their buffered messages.
    pub fn on_revoked(&self, partitions: &[Partition]) -> usize {
        if let Err(e) = self.log.pause(partitions) {
            warn!(partitions = partitions.len(), "failed to pause revoked partitions: {e}");
        }

        let purged = purge_revoked(&self.buffer, partitions);
        info!(revoked = partitions.len(), purged, "partitions revoked");
        purged
    }
}
