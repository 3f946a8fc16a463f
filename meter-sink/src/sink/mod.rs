//! The sink pipeline: ingestion loop, flush orchestration and shutdown.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::SinkBuffer;
use crate::dedupe::Deduplicator;
use crate::error::SinkError;
use crate::health::{ComponentStatus, HealthHandle};
use crate::kafka::{classify_poll_error, poll_backoff, LogClient, LogEvent, LogRecord};
use crate::types::DedupeIdentity;
use crate::meter_cache::MeterCache;
use crate::metrics_consts::{
    DEDUPE_STORE_ERRORS, SINK_BUFFER_SIZE, SINK_MESSAGES, SINK_MESSAGES_DROPPED,
};
use crate::notification::FlushEventHandler;
use crate::rebalance::PartitionRebalancer;
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::types::{Envelope, ProcessingStatus, SinkMessage};
use crate::validator;

mod flush;
pub mod namespace;
pub mod timer;

pub use flush::{FlushOutcome, FlushStats};
pub use namespace::{NamespaceResolver, DEFAULT_TOPIC_PATTERN, NAMESPACE_HEADER};
pub use timer::FlushTimer;

/// What to do with stored offsets when rows were persisted but their dedupe
/// keys could not be recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsistencyPolicy {
    /// Commit anyway. A replay cannot duplicate rows, but a later duplicate
    /// of these events will not be recognised.
    #[default]
    CommitAnyway,
    /// Skip the commit, so the records are read and stored again after a restart.
    HoldOffsets,
}

impl FromStr for ConsistencyPolicy {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit_anyway" => Ok(ConsistencyPolicy::CommitAnyway),
            "hold_offsets" => Ok(ConsistencyPolicy::HoldOffsets),
            other => Err(SinkError::ConfigInvalid(format!(
                "unknown consistency policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Flush as soon as this many messages are buffered.
    pub min_commit_count: usize,
    /// Flush at least this often, however few messages are buffered.
    pub max_commit_wait: Duration,
    pub max_poll_timeout: Duration,
    /// Bound on handing a flushed batch to the notification handlers.
    pub flush_success_timeout: Duration,
    /// Bound on waiting for notification handlers at shutdown.
    pub drain_timeout: Duration,
    pub dedupe_set_max_retries: u32,
    pub dedupe_set_initial_backoff: Duration,
    pub consistency_policy: ConsistencyPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            min_commit_count: 500,
            max_commit_wait: Duration::from_secs(5),
            max_poll_timeout: Duration::from_millis(100),
            flush_success_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            dedupe_set_max_retries: 3,
            dedupe_set_initial_backoff: Duration::from_millis(100),
            consistency_policy: ConsistencyPolicy::default(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), SinkError> {
        let invalid = |reason: &str| Err(SinkError::ConfigInvalid(reason.to_string()));

        if self.min_commit_count == 0 {
            return invalid("min_commit_count must be greater than 0");
        }
        if self.max_commit_wait.is_zero() {
            return invalid("max_commit_wait must be greater than 0");
        }
        if self.max_poll_timeout.is_zero() {
            return invalid("max_poll_timeout must be greater than 0");
        }
        if self.max_poll_timeout > self.max_commit_wait {
            return invalid("max_poll_timeout must not exceed max_commit_wait");
        }
        if self.flush_success_timeout.is_zero() {
            return invalid("flush_success_timeout must be greater than 0");
        }
        if self.drain_timeout.is_zero() {
            return invalid("drain_timeout must be greater than 0");
        }
        Ok(())
    }

    pub fn dedupe_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            2,
            self.dedupe_set_initial_backoff,
            Some(self.dedupe_set_initial_backoff * 32),
            self.dedupe_set_max_retries,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// Everything guarded by the sink lock.
struct SinkState {
    lifecycle: Lifecycle,
    timer: FlushTimer,
    notifications: Vec<JoinHandle<()>>,
    /// Dedupe keys of stored rows that are still to be recorded.
    unrecorded: Vec<DedupeIdentity>,
}

pub struct Sink {
    config: SinkConfig,
    log: Arc<dyn LogClient>,
    storage: Arc<dyn Storage>,
    deduplicator: Option<Arc<dyn Deduplicator>>,
    meter_cache: Arc<MeterCache>,
    resolver: NamespaceResolver,
    buffer: Arc<SinkBuffer>,
    rebalancer: PartitionRebalancer,
    handlers: Option<Arc<dyn FlushEventHandler>>,
    handler_shutdown: CancellationToken,
    health: Option<HealthHandle>,
    state: Mutex<SinkState>,
}

impl Sink {
    pub fn new(
        config: SinkConfig,
        log: Arc<dyn LogClient>,
        storage: Arc<dyn Storage>,
        meter_cache: Arc<MeterCache>,
        resolver: NamespaceResolver,
    ) -> Result<Self, SinkError> {
        config.validate()?;

        let buffer = Arc::new(SinkBuffer::new());
        let rebalancer = PartitionRebalancer::new(Arc::clone(&log), Arc::clone(&buffer));
        let timer = FlushTimer::new(config.max_commit_wait);

        Ok(Self {
            config,
            log,
            storage,
            deduplicator: None,
            meter_cache,
            resolver,
            buffer,
            rebalancer,
            handlers: None,
            handler_shutdown: CancellationToken::new(),
            health: None,
            state: Mutex::new(SinkState {
                lifecycle: Lifecycle::Idle,
                timer,
                notifications: Vec::new(),
                unrecorded: Vec::new(),
            }),
        })
    }

    pub fn with_deduplicator(mut self, deduplicator: Arc<dyn Deduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<dyn FlushEventHandler>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Use a buffer shared with the consumer context, which purges revoked
    /// partitions from it inside the rebalance callback.
    pub fn with_buffer(mut self, buffer: Arc<SinkBuffer>) -> Self {
        self.rebalancer = PartitionRebalancer::new(Arc::clone(&self.log), Arc::clone(&buffer));
        self.buffer = buffer;
        self
    }

    /// Report liveness from every iteration of the ingestion loop.
    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    pub fn buffer(&self) -> &SinkBuffer {
        &self.buffer
    }

    /// Consume until `shutdown` is cancelled or a fatal error occurs, then
    /// flush what is buffered and drain the notification handlers.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SinkError> {
        {
            let mut state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Idle {
                return Err(SinkError::IllegalState {
                    state: state.lifecycle.as_str(),
                    action: "run sink",
                });
            }
            state.lifecycle = Lifecycle::Running;
            state.timer.reset();
        }

        if let Some(handlers) = &self.handlers {
            if let Err(e) = handlers.start(self.handler_shutdown.clone()) {
                self.state.lock().await.lifecycle = Lifecycle::Stopped;
                error!(error = ?e, "failed to start flush handlers");
                return Err(e);
            }
        }

        info!("sink started");
        let result = self.consume(&shutdown).await;
        if let Err(e) = &result {
            if let Some(health) = &self.health {
                health.report_status(ComponentStatus::Unhealthy);
            }
            error!(error = ?e, kind = e.kind().as_str(), "sink stopped on fatal error");
        }

        self.shutdown().await;
        result
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<(), SinkError> {
        let mut kafka_error_count = 0;

        loop {
            if let Some(health) = &self.health {
                health.report_healthy();
            }

            let poll_timeout = self.poll_timeout().await;
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, leaving ingestion loop");
                    return Ok(());
                }
                polled = self.log.poll(poll_timeout) => polled,
            };

            let outcome = match polled {
                Ok(Some(LogEvent::Record(record))) => {
                    kafka_error_count = 0;
                    self.ingest(record).await
                }
                Ok(Some(LogEvent::Assigned(partitions))) => {
                    let _state = self.state.lock().await;
                    self.rebalancer.on_assigned(&partitions);
                    Ok(())
                }
                Ok(Some(LogEvent::Revoked(partitions))) => {
                    let _state = self.state.lock().await;
                    self.rebalancer.on_revoked(&partitions);
                    metrics::gauge!(SINK_BUFFER_SIZE).set(self.buffer.size() as f64);
                    Ok(())
                }
                Ok(None) => self.flush_if_due().await.map(|_| ()),
                Err(e) => {
                    kafka_error_count += 1;
                    let e = classify_poll_error(e);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tokio::time::sleep(poll_backoff(kafka_error_count)).await;
                    continue;
                }
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(error = ?e, kind = e.kind().as_str(), "ingestion error");
            }
        }
    }

    /// The poll never waits past the next timed flush.
    async fn poll_timeout(&self) -> Duration {
        let state = self.state.lock().await;
        state
            .timer
            .remaining()
            .min(self.config.max_poll_timeout)
            .max(Duration::from_millis(1))
    }

    /// Process one record, buffer it, and flush when a threshold is reached.
    pub async fn ingest(&self, record: LogRecord) -> Result<(), SinkError> {
        let message = self.process_record(record).await;

        let labels = [
            ("namespace", message.namespace.clone()),
            ("status", message.status().label().to_string()),
        ];
        metrics::counter!(SINK_MESSAGES, &labels).increment(1);

        let mut state = self.state.lock().await;
        self.buffer.add(message);
        let buffered = self.buffer.size();
        metrics::gauge!(SINK_BUFFER_SIZE).set(buffered as f64);

        if buffered >= self.config.min_commit_count || state.timer.elapsed() {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Flush whatever is buffered right now.
    pub async fn flush(&self) -> Result<FlushOutcome, SinkError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_if_due(&self) -> Result<FlushOutcome, SinkError> {
        let mut state = self.state.lock().await;
        if !state.timer.elapsed() {
            return Ok(FlushOutcome::Empty);
        }
        self.flush_locked(&mut state).await
    }

    async fn process_record(&self, record: LogRecord) -> SinkMessage {
        let ingested_at = record
            .timestamp_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let mut message = SinkMessage::new(record.coordinate.clone(), ingested_at);

        let Some(namespace) = self.resolver.resolve(&record) else {
            drop_message(&mut message, "namespace", "missing namespace");
            return message;
        };
        message.namespace = namespace;

        let envelope = match record.payload.as_deref().map(serde_json::from_slice::<Envelope>) {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                drop_message(&mut message, "decode", format!("failed to decode event: {e}"));
                return message;
            }
            None => {
                drop_message(&mut message, "decode", "empty payload");
                return message;
            }
        };

        let structural = envelope.validate();
        message.envelope = Some(envelope);
        if let Err(e) = structural {
            drop_message(&mut message, "envelope", e.to_string());
            return message;
        }

        if let (Some(deduplicator), Some(identity)) = (&self.deduplicator, message.identity()) {
            match deduplicator.check_unique(&identity).await {
                Ok(true) => {}
                Ok(false) => {
                    drop_message(&mut message, "duplicate", "duplicate");
                    return message;
                }
                Err(e) => {
                    metrics::counter!(DEDUPE_STORE_ERRORS, "operation" => "check_unique")
                        .increment(1);
                    warn!(
                        namespace = %message.namespace,
                        error = ?e,
                        "dedupe check failed, treating event as unique"
                    );
                }
            }
        }

        let snapshot = self.meter_cache.snapshot();
        validator::validate_message(&snapshot, &mut message);
        message
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;

        match self.flush_locked(&mut state).await {
            Ok(FlushOutcome::Flushed(stats)) => {
                info!(persisted = stats.persisted, "final flush completed")
            }
            Ok(FlushOutcome::Empty) => debug!("nothing buffered at shutdown"),
            Err(e) => error!(error = ?e, "final flush failed"),
        }

        for handle in state.notifications.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = ?e, "flush notification task ended abnormally");
            }
        }

        if let Some(handlers) = &self.handlers {
            self.handler_shutdown.cancel();
            if let Err(e) = handlers.close() {
                warn!(error = ?e, "failed to close flush handlers");
            }
            match tokio::time::timeout(self.config.drain_timeout, handlers.wait_for_drain()).await
            {
                Ok(Ok(())) => info!("flush handlers drained"),
                Ok(Err(e)) => warn!(error = ?e, "flush handlers failed to drain"),
                Err(_) => warn!(
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    "timed out waiting for flush handlers to drain"
                ),
            }
        }

        state.lifecycle = Lifecycle::Stopped;
        info!("sink stopped");
    }
}

fn drop_message(message: &mut SinkMessage, cause: &'static str, reason: impl Into<String>) {
    let reason = reason.into();
    debug!(
        topic = message.coordinate.topic(),
        partition = message.coordinate.partition_number(),
        offset = message.coordinate.offset(),
        namespace = %message.namespace,
        reason = %reason,
        "dropping message"
    );
    metrics::counter!(SINK_MESSAGES_DROPPED, "reason" => cause).increment(1);
    message.set_status(ProcessingStatus::drop(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::notification::{MeteredEventsCallback, QueuedFlushHandler};
    use crate::test_utils::{
        cloud_event, event_record, meter_cache_with, test_meter, MemoryStorage,
        RecordingDeduplicator, RecordingLogClient,
    };
    use crate::types::DedupeIdentity;

    async fn sink(config: SinkConfig) -> (Sink, Arc<RecordingLogClient>, Arc<MemoryStorage>) {
        let log = Arc::new(RecordingLogClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let cache = meter_cache_with(vec![test_meter(
            "acme",
            "api_duration",
            "api-calls",
            Some("$.duration_ms"),
        )])
        .await;
        let sink = Sink::new(
            config,
            log.clone(),
            storage.clone(),
            cache,
            NamespaceResolver::new(DEFAULT_TOPIC_PATTERN).unwrap(),
        )
        .unwrap();
        (sink, log, storage)
    }

    fn large_batches() -> SinkConfig {
        SinkConfig {
            min_commit_count: 1_000,
            max_commit_wait: Duration::from_secs(3600),
            ..SinkConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SinkConfig::default().validate().is_ok());

        let zero_count = SinkConfig {
            min_commit_count: 0,
            ..SinkConfig::default()
        };
        assert!(matches!(
            zero_count.validate(),
            Err(SinkError::ConfigInvalid(_))
        ));

        let slow_poll = SinkConfig {
            max_poll_timeout: Duration::from_secs(10),
            max_commit_wait: Duration::from_secs(1),
            ..SinkConfig::default()
        };
        assert!(slow_poll.validate().is_err());
    }

    #[test]
    fn test_consistency_policy_parsing() {
        assert_eq!(
            "commit_anyway".parse::<ConsistencyPolicy>().unwrap(),
            ConsistencyPolicy::CommitAnyway
        );
        assert_eq!(
            "HOLD_OFFSETS".parse::<ConsistencyPolicy>().unwrap(),
            ConsistencyPolicy::HoldOffsets
        );
        assert!("sometimes".parse::<ConsistencyPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_ingest_classifies_records() {
        let (sink, _log, _storage) = sink(large_batches()).await;

        let valid = cloud_event("evt-1", "api-calls", r#"{"duration_ms": 3}"#);
        sink.ingest(event_record("om_acme_events", 0, 1, &valid))
            .await
            .unwrap();
        sink.ingest(event_record("om_globex_events", 0, 1, &valid))
            .await
            .unwrap();
        sink.ingest(event_record("billing", 0, 1, &valid))
            .await
            .unwrap();
        let mut broken = event_record("om_acme_events", 0, 2, &valid);
        broken.payload = Some(b"{not json".to_vec());
        sink.ingest(broken).await.unwrap();
        let mut incomplete = valid.clone();
        incomplete.subject.clear();
        sink.ingest(event_record("om_acme_events", 0, 3, &incomplete))
            .await
            .unwrap();

        let mut messages = sink.buffer().dequeue();
        messages.sort_by(|a, b| a.coordinate.cmp(&b.coordinate));
        let statuses: Vec<(String, ProcessingStatus)> = messages
            .iter()
            .map(|m| (m.coordinate.to_string(), m.status().clone()))
            .collect();

        assert_eq!(statuses[0].0, "billing:0@1");
        assert_eq!(statuses[0].1, ProcessingStatus::drop("missing namespace"));
        assert_eq!(statuses[1].1, ProcessingStatus::Ok);
        assert!(statuses[2].1.is_drop());
        assert_eq!(
            statuses[3].1,
            ProcessingStatus::drop("event is missing required attribute: subject")
        );
        assert_eq!(
            statuses[4].1,
            ProcessingStatus::drop("namespace not found: globex")
        );
    }

    #[tokio::test]
    async fn test_ingest_drops_known_duplicates() {
        let (sink, _log, _storage) = sink(large_batches()).await;
        let deduplicator = Arc::new(RecordingDeduplicator::new());
        deduplicator.seed(&[DedupeIdentity::new("acme", "evt-1", "gateway")]);
        let sink = sink.with_deduplicator(deduplicator);

        let event = cloud_event("evt-1", "api-calls", r#"{"duration_ms": 3}"#);
        sink.ingest(event_record("om_acme_events", 0, 1, &event))
            .await
            .unwrap();

        let messages = sink.buffer().dequeue();
        assert_eq!(messages[0].status(), &ProcessingStatus::drop("duplicate"));
    }

    #[tokio::test]
    async fn test_dedupe_check_errors_treat_event_as_unique() {
        let (sink, _log, _storage) = sink(large_batches()).await;
        let deduplicator = Arc::new(RecordingDeduplicator::new());
        deduplicator.fail_checks(true);
        let sink = sink.with_deduplicator(deduplicator);

        let event = cloud_event("evt-1", "api-calls", r#"{"duration_ms": 3}"#);
        sink.ingest(event_record("om_acme_events", 0, 1, &event))
            .await
            .unwrap();

        assert!(sink.buffer().dequeue()[0].status().is_ok());
    }

    #[tokio::test]
    async fn test_reaching_min_commit_count_flushes() {
        let config = SinkConfig {
            min_commit_count: 2,
            max_commit_wait: Duration::from_secs(3600),
            ..SinkConfig::default()
        };
        let (sink, log, storage) = sink(config).await;
        let event = cloud_event("evt-1", "api-calls", r#"{"duration_ms": 3}"#);

        sink.ingest(event_record("om_acme_events", 0, 1, &event))
            .await
            .unwrap();
        assert!(storage.batches().is_empty());

        let second = cloud_event("evt-2", "api-calls", r#"{"duration_ms": 4}"#);
        sink.ingest(event_record("om_acme_events", 0, 2, &second))
            .await
            .unwrap();

        assert_eq!(storage.batches().len(), 1);
        assert_eq!(log.stored_offsets().len(), 2);
        assert!(sink.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_is_illegal() {
        let (sink, _log, _storage) = sink(large_batches()).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        sink.run(shutdown.clone()).await.unwrap();
        let err = sink.run(shutdown).await.unwrap_err();

        assert_eq!(err.to_string(), "cannot run sink while stopped");
    }

    #[tokio::test]
    async fn test_handler_start_failure_stops_the_sink() {
        let handler = QueuedFlushHandler::new(
            "metered_events",
            4,
            Duration::from_secs(1),
            Arc::new(MeteredEventsCallback),
        );
        // already running, so the sink cannot start it again
        handler.start(CancellationToken::new()).unwrap();
        let (sink, log, _storage) = sink(large_batches()).await;
        let sink = sink.with_handlers(Arc::new(handler));

        let err = sink.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot start flush handler while running");
        assert!(log.calls().is_empty());

        let err = sink.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot run sink while stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wait_is_bounded_by_the_next_timed_flush() {
        let config = SinkConfig {
            max_commit_wait: Duration::from_secs(1),
            max_poll_timeout: Duration::from_millis(500),
            ..SinkConfig::default()
        };
        let (sink, _log, _storage) = sink(config).await;

        assert_eq!(sink.poll_timeout().await, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(sink.poll_timeout().await, Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(sink.poll_timeout().await, Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingestion_loop_reports_liveness() {
        let registry = HealthRegistry::new("liveness");
        let (sink, _log, _storage) = sink(large_batches()).await;
        let sink = Arc::new(sink.with_health(registry.register("sink", Duration::from_secs(5))));
        assert!(!registry.get_status().healthy);

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let sink = Arc::clone(&sink);
            let shutdown = shutdown.clone();
            async move { sink.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        run.await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_fatal_error_marks_the_sink_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let (sink, log, _storage) = sink(SinkConfig {
            min_commit_count: 1,
            ..large_batches()
        })
        .await;
        let sink = sink.with_health(registry.register("sink", Duration::from_secs(30)));
        log.fail_pause(true);
        let event = cloud_event("evt-1", "api-calls", r#"{"duration_ms": 3}"#);
        log.push_record(event_record("om_acme_events", 0, 1, &event));

        let err = sink.run(CancellationToken::new()).await.unwrap_err();

        assert!(err.is_fatal());
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["sink"], ComponentStatus::Unhealthy);
    }
}
