use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use meter_sink::buffer::SinkBuffer;
use meter_sink::kafka::LogEvent;
use meter_sink::notification::{FlushCallback, FlushEventHandler, QueuedFlushHandler};
use meter_sink::sink::{
    ConsistencyPolicy, FlushOutcome, NamespaceResolver, Sink, SinkConfig, DEFAULT_TOPIC_PATTERN,
};
use meter_sink::test_utils::{
    cloud_event, event_record, meter_cache_with, test_meter, LogCall, MemoryStorage,
    RecordingDeduplicator, RecordingLogClient,
};
use meter_sink::types::{DedupeIdentity, FlushBatch, LogCoordinate, Partition};
use meter_sink::SinkError;

const TOPIC: &str = "om_acme_events";

struct Harness {
    sink: Arc<Sink>,
    log: Arc<RecordingLogClient>,
    storage: Arc<MemoryStorage>,
}

fn manual_flush_config() -> SinkConfig {
    SinkConfig {
        min_commit_count: 10_000,
        max_commit_wait: Duration::from_secs(3600),
        max_poll_timeout: Duration::from_millis(10),
        dedupe_set_max_retries: 1,
        dedupe_set_initial_backoff: Duration::from_millis(1),
        ..SinkConfig::default()
    }
}

async fn harness_with(
    config: SinkConfig,
    customize: impl FnOnce(Sink) -> Sink,
) -> Harness {
    let log = Arc::new(RecordingLogClient::new());
    log.set_assignment(vec![Partition::new(TOPIC, 0)]);
    let storage = Arc::new(MemoryStorage::new());
    let meters = meter_cache_with(vec![test_meter(
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
        meters,
        NamespaceResolver::new(DEFAULT_TOPIC_PATTERN).unwrap(),
    )
    .unwrap();

    Harness {
        sink: Arc::new(customize(sink)),
        log,
        storage,
    }
}

async fn harness() -> Harness {
    harness_with(manual_flush_config(), |sink| sink).await
}

fn api_call(id: &str) -> meter_sink::types::Envelope {
    cloud_event(id, "api-calls", r#"{"duration_ms": 12}"#)
}

fn coordinate(partition: i32, offset: i64) -> LogCoordinate {
    LogCoordinate::new(Partition::new(TOPIC, partition), offset)
}

fn flushed(outcome: FlushOutcome) -> meter_sink::sink::FlushStats {
    match outcome {
        FlushOutcome::Flushed(stats) => stats,
        FlushOutcome::Empty => panic!("expected a non-empty flush"),
    }
}

#[tokio::test]
async fn offsets_are_stored_ascending_after_rows_are_persisted() {
    let h = harness().await;
    for offset in [12, 10, 11] {
        let id = format!("evt-{offset}");
        h.sink
            .ingest(event_record(TOPIC, 0, offset, &api_call(&id)))
            .await
            .unwrap();
    }

    let stats = flushed(h.sink.flush().await.unwrap());

    assert_eq!(stats.persisted, 3);
    assert!(stats.committed);
    let ids: Vec<String> = h
        .storage
        .rows()
        .iter()
        .map(|m| m.envelope.as_ref().unwrap().id.clone())
        .collect();
    assert_eq!(ids, vec!["evt-10", "evt-11", "evt-12"]);

    let partition = vec![Partition::new(TOPIC, 0)];
    assert_eq!(
        h.log.calls(),
        vec![
            LogCall::Pause(partition.clone()),
            LogCall::StoreOffset(coordinate(0, 10)),
            LogCall::StoreOffset(coordinate(0, 11)),
            LogCall::StoreOffset(coordinate(0, 12)),
            LogCall::Commit,
            LogCall::Resume(partition),
        ]
    );
}

#[tokio::test]
async fn same_identity_at_two_coordinates_is_stored_once() {
    let h = harness().await;
    h.sink
        .ingest(event_record(TOPIC, 0, 5, &api_call("evt-1")))
        .await
        .unwrap();
    h.sink
        .ingest(event_record(TOPIC, 0, 6, &api_call("evt-1")))
        .await
        .unwrap();

    let stats = flushed(h.sink.flush().await.unwrap());

    assert_eq!(stats.persisted, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(h.storage.rows()[0].coordinate, coordinate(0, 5));
    assert_eq!(
        h.log.stored_offsets(),
        vec![coordinate(0, 5), coordinate(0, 6)]
    );
}

#[tokio::test]
async fn redelivered_coordinate_collapses_in_the_buffer() {
    let h = harness().await;
    h.sink
        .ingest(event_record(TOPIC, 0, 5, &api_call("evt-1")))
        .await
        .unwrap();
    h.sink
        .ingest(event_record(TOPIC, 0, 5, &api_call("evt-1")))
        .await
        .unwrap();

    assert_eq!(h.sink.buffer().size(), 1);
    let stats = flushed(h.sink.flush().await.unwrap());
    assert_eq!(stats.dequeued, 1);
}

#[tokio::test]
async fn storage_failure_skips_offsets_and_dedupe_keys() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    let h = harness_with(manual_flush_config(), {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;
    h.storage.fail(true);
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();

    let err = h.sink.flush().await.unwrap_err();

    assert!(matches!(err, SinkError::Persistence { .. }));
    assert!(err.is_fatal());
    assert!(h.log.stored_offsets().is_empty());
    assert_eq!(h.log.commits(), 0);
    assert_eq!(deduplicator.set_calls(), 0);
    assert!(matches!(h.log.calls().last(), Some(LogCall::Resume(_))));
}

#[tokio::test(start_paused = true)]
async fn empty_flush_makes_no_calls_and_resets_the_timer() {
    let config = SinkConfig {
        max_commit_wait: Duration::from_secs(5),
        ..manual_flush_config()
    };
    let h = harness_with(config, |sink| sink).await;

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(h.sink.flush().await.unwrap(), FlushOutcome::Empty);
    assert!(h.log.calls().is_empty());
    assert!(h.storage.batches().is_empty());

    // the timer restarted, so this record does not trigger a flush
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();
    assert!(h.storage.batches().is_empty());

    tokio::time::advance(Duration::from_secs(5)).await;
    h.sink
        .ingest(event_record(TOPIC, 0, 2, &api_call("evt-2")))
        .await
        .unwrap();
    assert_eq!(h.storage.rows().len(), 2);
}

#[tokio::test]
async fn unknown_namespace_is_dropped_but_its_offset_is_committed() {
    let h = harness().await;
    let globex = LogCoordinate::new(Partition::new("om_globex_events", 0), 3);
    h.sink
        .ingest(event_record("om_globex_events", 0, 3, &api_call("evt-1")))
        .await
        .unwrap();

    let stats = flushed(h.sink.flush().await.unwrap());

    assert_eq!(stats.persisted, 0);
    assert_eq!(stats.dropped, 1);
    assert!(h.storage.batches().is_empty());
    assert_eq!(h.log.stored_offsets(), vec![globex]);
    assert_eq!(h.log.commits(), 1);
}

#[tokio::test]
async fn invalid_events_are_stored_without_recording_dedupe_keys() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    let h = harness_with(manual_flush_config(), {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();
    h.sink
        .ingest(event_record(
            TOPIC,
            0,
            2,
            &cloud_event("evt-2", "logins", "{}"),
        ))
        .await
        .unwrap();

    flushed(h.sink.flush().await.unwrap());

    let rows = h.storage.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1].status().validation_error(),
        Some("no meter found for event type: logins")
    );
    assert!(deduplicator.contains(&DedupeIdentity::new("acme", "evt-1", "gateway")));
    assert!(!deduplicator.contains(&DedupeIdentity::new("acme", "evt-2", "gateway")));
}

#[tokio::test]
async fn events_known_to_the_dedupe_store_are_not_stored_again() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    let h = harness_with(manual_flush_config(), {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();
    // recorded by another consumer after this event was ingested
    deduplicator.seed(&[DedupeIdentity::new("acme", "evt-1", "gateway")]);

    let stats = flushed(h.sink.flush().await.unwrap());

    assert_eq!(stats.persisted, 0);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(h.log.stored_offsets(), vec![coordinate(0, 1)]);
}

#[tokio::test]
async fn consistency_failure_commits_by_default() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    deduplicator.fail_next_sets(10);
    let h = harness_with(manual_flush_config(), {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();

    let stats = flushed(h.sink.flush().await.unwrap());

    assert!(!stats.consistent);
    assert!(stats.committed);
    assert_eq!(deduplicator.set_calls(), 2);
    assert_eq!(h.log.commits(), 1);
}

#[tokio::test]
async fn consistency_failure_holds_offsets_when_configured() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    deduplicator.fail_next_sets(10);
    let config = SinkConfig {
        consistency_policy: ConsistencyPolicy::HoldOffsets,
        ..manual_flush_config()
    };
    let h = harness_with(config, {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();

    let stats = flushed(h.sink.flush().await.unwrap());

    assert!(!stats.consistent);
    assert!(!stats.committed);
    assert_eq!(h.storage.rows().len(), 1);
    assert_eq!(h.log.stored_offsets(), vec![coordinate(0, 1)]);
    assert_eq!(h.log.commits(), 0);
    assert!(matches!(h.log.calls().last(), Some(LogCall::Resume(_))));
}

#[tokio::test]
async fn held_offsets_stay_uncommitted_until_pending_keys_are_recorded() {
    let deduplicator = Arc::new(RecordingDeduplicator::new());
    // two attempts per flush: the first two flushes fail to record keys
    deduplicator.fail_next_sets(4);
    let config = SinkConfig {
        consistency_policy: ConsistencyPolicy::HoldOffsets,
        ..manual_flush_config()
    };
    let h = harness_with(config, {
        let deduplicator = deduplicator.clone();
        move |sink| sink.with_deduplicator(deduplicator)
    })
    .await;

    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();
    assert!(!flushed(h.sink.flush().await.unwrap()).committed);

    h.sink
        .ingest(event_record(TOPIC, 0, 2, &api_call("evt-2")))
        .await
        .unwrap();
    let second = flushed(h.sink.flush().await.unwrap());

    assert!(!second.consistent);
    assert!(!second.committed);
    assert_eq!(h.log.commits(), 0);
    assert_eq!(
        h.log.stored_offsets(),
        vec![coordinate(0, 1), coordinate(0, 2)]
    );

    // nothing buffered, but the pending keys are retried before committing
    let third = flushed(h.sink.flush().await.unwrap());

    assert_eq!(third.dequeued, 0);
    assert!(third.consistent);
    assert!(third.committed);
    assert_eq!(h.log.commits(), 1);
    assert!(deduplicator.contains(&DedupeIdentity::new("acme", "evt-1", "gateway")));
    assert!(deduplicator.contains(&DedupeIdentity::new("acme", "evt-2", "gateway")));
    assert_eq!(h.storage.rows().len(), 2);

    assert_eq!(h.sink.flush().await.unwrap(), FlushOutcome::Empty);
}

#[tokio::test]
async fn offset_store_and_commit_failures_do_not_fail_the_flush() {
    let h = harness().await;
    h.log.fail_store(true);
    h.log.fail_commit(true);
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();

    let stats = flushed(h.sink.flush().await.unwrap());

    assert_eq!(stats.offset_store_failures, 1);
    assert!(!stats.committed);
    assert_eq!(h.storage.rows().len(), 1);
}

#[tokio::test]
async fn pause_failure_is_fatal_and_keeps_the_buffer() {
    let h = harness().await;
    h.log.fail_pause(true);
    h.sink
        .ingest(event_record(TOPIC, 0, 1, &api_call("evt-1")))
        .await
        .unwrap();

    let err = h.sink.flush().await.unwrap_err();

    assert!(matches!(err, SinkError::Kafka(_)));
    assert_eq!(h.sink.buffer().size(), 1);
    assert!(h.storage.batches().is_empty());
    assert_eq!(
        h.log.calls(),
        vec![LogCall::Resume(vec![Partition::new(TOPIC, 0)])]
    );
}

async fn wait_until_consumed(log: &RecordingLogClient) {
    while log.pending() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // let the loop finish handling the last event
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn revoked_partitions_are_purged_from_the_buffer() {
    let h = harness().await;
    for partition in [0, 1] {
        for offset in 0..3 {
            let id = format!("evt-{partition}-{offset}");
            h.log
                .push_record(event_record(TOPIC, partition, offset, &api_call(&id)));
        }
    }
    h.log
        .push_event(LogEvent::Revoked(vec![Partition::new(TOPIC, 1)]));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let sink = h.sink.clone();
        let shutdown = shutdown.clone();
        async move { sink.run(shutdown).await }
    });

    wait_until_consumed(&h.log).await;
    assert_eq!(h.sink.buffer().size(), 3);

    shutdown.cancel();
    run.await.unwrap().unwrap();

    let rows = h.storage.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|m| m.coordinate.partition_number() == 0));
    assert!(h
        .log
        .stored_offsets()
        .iter()
        .all(|c| c.partition_number() == 0));
    assert!(h
        .log
        .calls()
        .contains(&LogCall::Pause(vec![Partition::new(TOPIC, 1)])));
}

#[tokio::test]
async fn revoke_purges_the_buffer_before_the_same_poll_triggers_a_flush() {
    let buffer = Arc::new(SinkBuffer::new());
    let config = SinkConfig {
        min_commit_count: 3,
        ..manual_flush_config()
    };
    let h = harness_with(config, {
        let buffer = buffer.clone();
        move |sink| sink.with_buffer(buffer)
    })
    .await;
    h.log.attach_buffer(buffer);

    h.log
        .push_record(event_record(TOPIC, 1, 0, &api_call("evt-1-0")));
    h.log
        .push_record(event_record(TOPIC, 1, 1, &api_call("evt-1-1")));
    // one poll runs the revoke callback and returns a record that would
    // reach the flush threshold if partition 1 were still buffered
    h.log.push_revoke_with_record(
        vec![Partition::new(TOPIC, 1)],
        event_record(TOPIC, 0, 0, &api_call("evt-0-0")),
    );
    h.log
        .push_record(event_record(TOPIC, 0, 1, &api_call("evt-0-1")));
    h.log
        .push_record(event_record(TOPIC, 0, 2, &api_call("evt-0-2")));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let sink = h.sink.clone();
        let shutdown = shutdown.clone();
        async move { sink.run(shutdown).await }
    });

    wait_until_consumed(&h.log).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    let batches = h.storage.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0].iter().all(|m| m.coordinate.partition_number() == 0));
    assert!(h
        .log
        .stored_offsets()
        .iter()
        .all(|c| c.partition_number() == 0));
}

struct CountingCallback {
    batches: AtomicUsize,
}

#[async_trait]
impl FlushCallback for CountingCallback {
    async fn on_flush(&self, _batch: FlushBatch) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_drains_every_flushed_batch_to_handlers() {
    let callback = Arc::new(CountingCallback {
        batches: AtomicUsize::new(0),
    });
    let handler = Arc::new(QueuedFlushHandler::new(
        "counter",
        2,
        Duration::from_secs(1),
        callback.clone(),
    ));
    let drained = Arc::new(AtomicUsize::new(0));
    handler.on_drain_complete(Box::new({
        let drained = drained.clone();
        move || {
            drained.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let config = SinkConfig {
        min_commit_count: 1,
        ..manual_flush_config()
    };
    let h = harness_with(config, {
        let handler = handler.clone();
        move |sink| sink.with_handlers(handler)
    })
    .await;

    for offset in 0..5 {
        let id = format!("evt-{offset}");
        h.log
            .push_record(event_record(TOPIC, 0, offset, &api_call(&id)));
    }

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let sink = h.sink.clone();
        let shutdown = shutdown.clone();
        async move { sink.run(shutdown).await }
    });

    wait_until_consumed(&h.log).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(h.storage.batches().len(), 5);
    assert_eq!(callback.batches.load(Ordering::SeqCst), 5);
    assert_eq!(drained.load(Ordering::SeqCst), 1);
    assert_eq!(handler.stats().processed, 5);
}

#[tokio::test]
async fn assignment_resumes_consumption() {
    let h = harness().await;
    h.log
        .push_event(LogEvent::Assigned(vec![Partition::new(TOPIC, 1)]));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let sink = h.sink.clone();
        let shutdown = shutdown.clone();
        async move { sink.run(shutdown).await }
    });

    wait_until_consumed(&h.log).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(
        h.log.calls(),
        vec![LogCall::Resume(vec![
            Partition::new(TOPIC, 0),
            Partition::new(TOPIC, 1)
        ])]
    );
}
