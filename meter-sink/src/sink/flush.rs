use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{ConsistencyPolicy, Sink, SinkState};
use crate::dedupe::set_with_retry;
use crate::error::SinkError;
use crate::metrics_consts::{
    DEDUPE_STORE_ERRORS, FLUSH_NOTIFICATION_TIMEOUT, SINK_BUFFER_SIZE, SINK_CONSISTENCY_FAILURE,
    SINK_DUPLICATES, SINK_FLUSH, SINK_FLUSH_BATCH_SIZE, SINK_FLUSH_DURATION_MS,
    SINK_OFFSET_COMMIT, SINK_OFFSET_STORE_FAILED, SINK_ROWS_PERSISTED,
};
use crate::types::{DedupeIdentity, FlushBatch, LogCoordinate, SinkMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered; no storage or offset calls were made.
    Empty,
    Flushed(FlushStats),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub dequeued: usize,
    pub persisted: usize,
    pub dropped: usize,
    pub duplicates: usize,
    pub offsets_stored: usize,
    pub offset_store_failures: usize,
    /// False when rows were stored but their dedupe keys were not recorded.
    pub consistent: bool,
    pub committed: bool,
}

impl Sink {
    /// One flush cycle. The caller holds the sink lock.
    ///
    /// Consumption is paused for the whole cycle and resumed on every exit path.
    /// Rows are stored before any offset is stored, and offsets are committed
    /// only after the dedupe keys of stored rows were recorded (or the
    /// consistency policy says to commit anyway). Under `HoldOffsets`, keys
    /// that could not be recorded are retried by every later flush, even one
    /// with nothing buffered, and no commit happens until they are recorded.
    pub(super) async fn flush_locked(
        &self,
        state: &mut SinkState,
    ) -> Result<FlushOutcome, SinkError> {
        state.notifications.retain(|handle| !handle.is_finished());

        if self.buffer.is_empty() && state.unrecorded.is_empty() {
            state.timer.reset();
            return Ok(FlushOutcome::Empty);
        }

        let started = Instant::now();
        let assignment = self.log.assignment()?;

        let result = match self.log.pause(&assignment) {
            Ok(()) => self.flush_paused(state).await,
            Err(e) => Err(SinkError::Kafka(e)),
        };

        if let Err(e) = self.log.resume(&assignment) {
            warn!(partitions = assignment.len(), "failed to resume partitions after flush: {e}");
        }
        state.timer.reset();
        metrics::gauge!(SINK_BUFFER_SIZE).set(self.buffer.size() as f64);

        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(SINK_FLUSH, "outcome" => outcome).increment(1);
        metrics::histogram!(SINK_FLUSH_DURATION_MS).record(started.elapsed().as_millis() as f64);

        result
    }

    async fn flush_paused(&self, state: &mut SinkState) -> Result<FlushOutcome, SinkError> {
        let mut batch = self.buffer.dequeue();
        if batch.is_empty() && state.unrecorded.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        batch.sort_by(|a, b| a.coordinate.cmp(&b.coordinate));
        metrics::histogram!(SINK_FLUSH_BATCH_SIZE).record(batch.len() as f64);

        let mut stats = FlushStats {
            dequeued: batch.len(),
            consistent: true,
            ..FlushStats::default()
        };

        let coordinates: Vec<LogCoordinate> =
            batch.iter().map(|m| m.coordinate.clone()).collect();
        let persisted = self.select_rows(batch, &mut stats).await;

        if !persisted.is_empty() {
            self.storage
                .batch_insert(&persisted)
                .await
                .map_err(|e| match e {
                    SinkError::Persistence { .. } => e,
                    other => SinkError::persistence("batch insert failed", other),
                })?;
        }
        stats.persisted = persisted.len();
        metrics::counter!(SINK_ROWS_PERSISTED).increment(persisted.len() as u64);

        for coordinate in &coordinates {
            match self.log.store_offset(coordinate) {
                Ok(()) => stats.offsets_stored += 1,
                Err(e) => {
                    stats.offset_store_failures += 1;
                    metrics::counter!(SINK_OFFSET_STORE_FAILED).increment(1);
                    warn!(
                        topic = coordinate.topic(),
                        partition = coordinate.partition_number(),
                        offset = coordinate.offset(),
                        "failed to store offset: {e}"
                    );
                }
            }
        }

        if let Some(deduplicator) = &self.deduplicator {
            let mut recorded = std::mem::take(&mut state.unrecorded);
            recorded.extend(
                persisted
                    .iter()
                    .filter(|m| m.status().is_ok())
                    .filter_map(SinkMessage::identity),
            );
            let policy = self.config.dedupe_retry_policy();

            match set_with_retry(deduplicator.as_ref(), &recorded, &policy).await {
                Ok(existing) if !existing.is_empty() => {
                    debug!(existing = existing.len(), "dedupe keys were already recorded")
                }
                Ok(_) => {}
                Err(e) => {
                    stats.consistent = false;
                    metrics::counter!(SINK_CONSISTENCY_FAILURE).increment(1);
                    metrics::counter!(DEDUPE_STORE_ERRORS, "operation" => "set").increment(1);
                    error!(
                        event = "consistency_failure",
                        rows = persisted.len(),
                        keys = recorded.len(),
                        policy = ?self.config.consistency_policy,
                        error = ?e,
                        "rows were stored but their dedupe keys were not recorded"
                    );
                    // retried by the next flush, ahead of its commit
                    if self.config.consistency_policy == ConsistencyPolicy::HoldOffsets {
                        state.unrecorded = recorded;
                    }
                }
            }
        }

        if stats.consistent || self.config.consistency_policy == ConsistencyPolicy::CommitAnyway {
            match self.log.commit() {
                Ok(()) => {
                    stats.committed = true;
                    metrics::counter!(SINK_OFFSET_COMMIT, "outcome" => "success").increment(1);
                }
                Err(e) => {
                    metrics::counter!(SINK_OFFSET_COMMIT, "outcome" => "failure").increment(1);
                    warn!("failed to commit offsets, they will be committed with the next flush: {e}");
                }
            }
        } else {
            warn!(
                offsets = coordinates.len(),
                pending_keys = state.unrecorded.len(),
                "holding offsets until the pending dedupe keys are recorded"
            );
        }

        info!(
            dequeued = stats.dequeued,
            persisted = stats.persisted,
            dropped = stats.dropped,
            duplicates = stats.duplicates,
            committed = stats.committed,
            "flushed batch"
        );

        if !persisted.is_empty() {
            self.notify(state, Arc::new(persisted));
        }

        Ok(FlushOutcome::Flushed(stats))
    }

    /// Pick the rows to store from a coordinate-sorted batch. Dropped messages
    /// are never stored; of several messages sharing an identity only the one
    /// with the lowest coordinate is kept, and identities the dedupe store
    /// already knows are skipped.
    async fn select_rows(&self, batch: Vec<SinkMessage>, stats: &mut FlushStats) -> Vec<SinkMessage> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(batch.len());
        for message in batch {
            if message.status().is_drop() {
                stats.dropped += 1;
                continue;
            }
            let Some(identity) = message.identity() else {
                stats.dropped += 1;
                continue;
            };
            if seen.insert(identity.clone()) {
                candidates.push((identity, message));
            } else {
                stats.duplicates += 1;
                metrics::counter!(SINK_DUPLICATES, "scope" => "batch").increment(1);
            }
        }

        let Some(deduplicator) = &self.deduplicator else {
            return candidates.into_iter().map(|(_, m)| m).collect();
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let identities: Vec<DedupeIdentity> = candidates.iter().map(|(id, _)| id.clone()).collect();
        match deduplicator.check_unique_batch(&identities).await {
            Ok(unique) => {
                let before = candidates.len();
                let rows: Vec<SinkMessage> = candidates
                    .into_iter()
                    .filter(|(id, _)| unique.contains(id))
                    .map(|(_, m)| m)
                    .collect();
                let known = before - rows.len();
                stats.duplicates += known;
                metrics::counter!(SINK_DUPLICATES, "scope" => "store").increment(known as u64);
                rows
            }
            Err(e) => {
                metrics::counter!(DEDUPE_STORE_ERRORS, "operation" => "check_unique_batch")
                    .increment(1);
                warn!(error = ?e, "dedupe batch check failed, storing every candidate");
                candidates.into_iter().map(|(_, m)| m).collect()
            }
        }
    }

    fn notify(&self, state: &mut SinkState, batch: FlushBatch) {
        let Some(handlers) = &self.handlers else {
            return;
        };
        let handlers = Arc::clone(handlers);
        let timeout = self.config.flush_success_timeout;

        state.notifications.push(tokio::spawn(async move {
            match tokio::time::timeout(timeout, handlers.on_flush_success(batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = ?e, "flush handlers rejected batch"),
                Err(_) => {
                    metrics::counter!(FLUSH_NOTIFICATION_TIMEOUT).increment(1);
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "timed out handing flushed batch to handlers"
                    );
                }
            }
        }));
    }
}
