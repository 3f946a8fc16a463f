//! In-memory stand-ins for the sink's collaborators, shared by unit and
//! integration tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};

use crate::buffer::SinkBuffer;
use crate::dedupe::Deduplicator;
use crate::error::SinkError;
use crate::kafka::{LogClient, LogEvent, LogRecord};
use crate::meter_cache::{MeterCache, StaticMeterLookup};
use crate::rebalance::purge_revoked;
use crate::storage::Storage;
use crate::types::{
    Aggregation, DedupeIdentity, Envelope, LogCoordinate, Meter, Partition, SinkMessage,
};

/// A SUM meter when `value_property` is set, a COUNT meter otherwise.
pub fn test_meter(
    namespace: &str,
    slug: &str,
    event_type: &str,
    value_property: Option<&str>,
) -> Meter {
    Meter {
        namespace: namespace.to_string(),
        slug: slug.to_string(),
        event_type: event_type.to_string(),
        aggregation: if value_property.is_some() {
            Aggregation::Sum
        } else {
            Aggregation::Count
        },
        value_property: value_property.map(str::to_string),
        group_by: Default::default(),
    }
}

/// An event from the `gateway` source about `customer-1`.
pub fn cloud_event(id: &str, event_type: &str, data: &str) -> Envelope {
    Envelope {
        id: id.to_string(),
        event_type: event_type.to_string(),
        source: "gateway".to_string(),
        subject: "customer-1".to_string(),
        time: 1_700_000_000,
        data: data.to_string(),
    }
}

/// A bare message with no envelope, as if nothing had been decoded yet.
pub fn sink_message(topic: &str, partition: i32, offset: i64) -> SinkMessage {
    SinkMessage::new(
        LogCoordinate::new(Partition::new(topic, partition), offset),
        Utc::now(),
    )
}

/// A record carrying `envelope` as its JSON payload.
pub fn event_record(topic: &str, partition: i32, offset: i64, envelope: &Envelope) -> LogRecord {
    LogRecord {
        coordinate: LogCoordinate::new(Partition::new(topic, partition), offset),
        key: None,
        headers: Vec::new(),
        payload: serde_json::to_vec(envelope).ok(),
        timestamp_ms: Some(1_700_000_001_000),
    }
}

/// A meter cache already loaded with `meters`, without a refresh task.
pub async fn meter_cache_with(meters: Vec<Meter>) -> Arc<MeterCache> {
    let cache = Arc::new(MeterCache::new(
        Arc::new(StaticMeterLookup::from_meters(meters)),
        Duration::from_secs(60),
        Duration::from_secs(5),
    ));
    cache
        .refresh()
        .await
        .expect("static meter lookup never fails");
    cache
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCall {
    Pause(Vec<Partition>),
    Resume(Vec<Partition>),
    StoreOffset(LogCoordinate),
    Commit,
}

enum Scripted {
    Event(LogEvent),
    /// A revoke whose rebalance callback runs inside the poll that returns
    /// the record.
    RevokeDuring(Vec<Partition>, LogRecord),
}

/// Scripted log client. Events are served in push order; every control call
/// is recorded so tests can assert on ordering.
#[derive(Default)]
pub struct RecordingLogClient {
    events: Mutex<VecDeque<Scripted>>,
    rebalance_buffer: Mutex<Option<Arc<SinkBuffer>>>,
    assignment: Mutex<Vec<Partition>>,
    calls: Mutex<Vec<LogCall>>,
    fail_pause: AtomicBool,
    fail_store: AtomicBool,
    fail_commit: AtomicBool,
}

impl RecordingLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_assignment(&self, partitions: Vec<Partition>) {
        *self.assignment.lock() = partitions;
    }

    /// Queue a record, adding its partition to the assignment.
    pub fn push_record(&self, record: LogRecord) {
        let partition = record.coordinate.partition().clone();
        {
            let mut assignment = self.assignment.lock();
            if !assignment.contains(&partition) {
                assignment.push(partition);
            }
        }
        self.events.lock().push_back(Scripted::Event(LogEvent::Record(record)));
    }

    pub fn push_event(&self, event: LogEvent) {
        self.events.lock().push_back(Scripted::Event(event));
    }

    /// The buffer purged by revoke callbacks, like the Kafka consumer context.
    pub fn attach_buffer(&self, buffer: Arc<SinkBuffer>) {
        *self.rebalance_buffer.lock() = Some(buffer);
    }

    /// Revoke `partitions` inside the poll that returns `record`. The
    /// `Revoked` event itself is served by the following poll.
    pub fn push_revoke_with_record(&self, partitions: Vec<Partition>, record: LogRecord) {
        self.events
            .lock()
            .push_back(Scripted::RevokeDuring(partitions, record));
    }

    pub fn pending(&self) -> usize {
        self.events.lock().len()
    }

    pub fn fail_pause(&self, fail: bool) {
        self.fail_pause.store(fail, Ordering::SeqCst);
    }

    pub fn fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LogCall> {
        self.calls.lock().clone()
    }

    pub fn stored_offsets(&self) -> Vec<LogCoordinate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                LogCall::StoreOffset(coordinate) => Some(coordinate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn commits(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == LogCall::Commit)
            .count()
    }
}

#[async_trait]
impl LogClient for RecordingLogClient {
    async fn poll(&self, timeout: Duration) -> KafkaResult<Option<LogEvent>> {
        let next = self.events.lock().pop_front();
        let next = match next {
            Some(Scripted::RevokeDuring(partitions, record)) => {
                {
                    let mut assignment = self.assignment.lock();
                    assignment.retain(|partition| !partitions.contains(partition));
                    let partition = record.coordinate.partition().clone();
                    if !assignment.contains(&partition) {
                        assignment.push(partition);
                    }
                }
                if let Some(buffer) = self.rebalance_buffer.lock().as_ref() {
                    purge_revoked(buffer, &partitions);
                }
                self.events
                    .lock()
                    .push_front(Scripted::Event(LogEvent::Revoked(partitions)));
                return Ok(Some(LogEvent::Record(record)));
            }
            Some(Scripted::Event(event)) => Some(event),
            None => None,
        };

        match next {
            Some(LogEvent::Assigned(partitions)) => {
                let mut assignment = self.assignment.lock();
                for partition in &partitions {
                    if !assignment.contains(partition) {
                        assignment.push(partition.clone());
                    }
                }
                Ok(Some(LogEvent::Assigned(partitions)))
            }
            Some(LogEvent::Revoked(partitions)) => {
                self.assignment
                    .lock()
                    .retain(|partition| !partitions.contains(partition));
                Ok(Some(LogEvent::Revoked(partitions)))
            }
            Some(record) => Ok(Some(record)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    fn assignment(&self) -> KafkaResult<Vec<Partition>> {
        Ok(self.assignment.lock().clone())
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(KafkaError::PauseResume(RDKafkaErrorCode::Fail.to_string()));
        }
        self.calls.lock().push(LogCall::Pause(partitions.to_vec()));
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.calls.lock().push(LogCall::Resume(partitions.to_vec()));
        Ok(())
    }

    fn store_offset(&self, coordinate: &LogCoordinate) -> KafkaResult<()> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(KafkaError::StoreOffset(RDKafkaErrorCode::Fail));
        }
        self.calls.lock().push(LogCall::StoreOffset(coordinate.clone()));
        Ok(())
    }

    fn commit(&self) -> KafkaResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::Fail));
        }
        self.calls.lock().push(LogCall::Commit);
        Ok(())
    }
}

/// Storage that keeps every inserted batch in memory.
#[derive(Default)]
pub struct MemoryStorage {
    batches: Mutex<Vec<Vec<SinkMessage>>>,
    fail: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<SinkMessage>> {
        self.batches.lock().clone()
    }

    pub fn rows(&self) -> Vec<SinkMessage> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn batch_insert(&self, messages: &[SinkMessage]) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Persistence {
                message: "storage unavailable".to_string(),
                source: None,
            });
        }
        self.batches.lock().push(messages.to_vec());
        Ok(())
    }
}

/// Deduplicator over a plain set, with switches for injecting failures.
#[derive(Default)]
pub struct RecordingDeduplicator {
    keys: Mutex<HashSet<DedupeIdentity>>,
    failing_sets: AtomicU32,
    fail_checks: AtomicBool,
    set_calls: AtomicUsize,
}

impl RecordingDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to `set` fail without recording anything.
    pub fn fail_next_sets(&self, count: u32) {
        self.failing_sets.store(count, Ordering::SeqCst);
    }

    pub fn fail_checks(&self, fail: bool) {
        self.fail_checks.store(fail, Ordering::SeqCst);
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn seed(&self, identities: &[DedupeIdentity]) {
        self.keys.lock().extend(identities.iter().cloned());
    }

    pub fn contains(&self, identity: &DedupeIdentity) -> bool {
        self.keys.lock().contains(identity)
    }

    fn check_failure(&self) -> Result<(), SinkError> {
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(SinkError::Dedupe {
                message: "dedupe store unavailable".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Deduplicator for RecordingDeduplicator {
    async fn check_unique(&self, identity: &DedupeIdentity) -> Result<bool, SinkError> {
        self.check_failure()?;
        Ok(!self.keys.lock().contains(identity))
    }

    async fn check_unique_batch(
        &self,
        identities: &[DedupeIdentity],
    ) -> Result<HashSet<DedupeIdentity>, SinkError> {
        self.check_failure()?;
        let keys = self.keys.lock();
        Ok(identities
            .iter()
            .filter(|identity| !keys.contains(identity))
            .cloned()
            .collect())
    }

    async fn set(&self, identities: &[DedupeIdentity]) -> Result<Vec<DedupeIdentity>, SinkError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_sets.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sets.store(failing - 1, Ordering::SeqCst);
            return Err(SinkError::Dedupe {
                message: "dedupe store unavailable".to_string(),
                source: None,
            });
        }

        let mut keys = self.keys.lock();
        Ok(identities
            .iter()
            .filter(|identity| !keys.insert((*identity).clone()))
            .cloned()
            .collect())
    }
}
