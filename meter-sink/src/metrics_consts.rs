// ==== Ingestion ====
/// Counter for processed messages, labelled by namespace and status (ok/drop/invalid)
pub const SINK_MESSAGES: &str = "sink_messages_total";

/// Counter for messages dropped before reaching the buffer, labelled by reason
pub const SINK_MESSAGES_DROPPED: &str = "sink_messages_dropped_total";

/// Gauge for the number of buffered, not yet flushed messages
pub const SINK_BUFFER_SIZE: &str = "sink_buffer_size";

// ==== Flush ====
/// Counter for flush cycles, labelled by status
pub const SINK_FLUSH: &str = "sink_flush_total";

/// Histogram for end-to-end flush duration
pub const SINK_FLUSH_DURATION_MS: &str = "sink_flush_duration_ms";

/// Histogram for the number of messages dequeued per flush
pub const SINK_FLUSH_BATCH_SIZE: &str = "sink_flush_batch_size";

/// Counter for rows written to storage
pub const SINK_ROWS_PERSISTED: &str = "sink_rows_persisted_total";

/// Counter for duplicates removed during a flush, labelled by stage (batch/store)
pub const SINK_DUPLICATES: &str = "sink_duplicate_events_total";

/// Counter for offsets that could not be stored on the consumer
pub const SINK_OFFSET_STORE_FAILED: &str = "sink_offset_store_failed_total";

/// Counter for offset commits, labelled by status
pub const SINK_OFFSET_COMMIT: &str = "sink_offset_commit_total";

/// Counter for flushes where rows were persisted but dedupe keys could not be recorded
pub const SINK_CONSISTENCY_FAILURE: &str = "sink_consistency_failure_total";

/// Counter for deduplication store errors, labelled by operation
pub const DEDUPE_STORE_ERRORS: &str = "sink_dedupe_store_errors_total";

// ==== Meter cache ====
/// Counter for meter cache refreshes, labelled by status
pub const METER_CACHE_REFRESH: &str = "meter_cache_refresh_total";

/// Gauge for the number of namespaces in the current snapshot
pub const METER_CACHE_NAMESPACES: &str = "meter_cache_namespaces";

/// Gauge for meters left out of the current snapshot because their paths did not parse
pub const METER_CACHE_REJECTED_METERS: &str = "meter_cache_rejected_meters";

// ==== Kafka consumer ====
/// Counter for consumer errors, labelled by source (poll or client) and origin
pub const KAFKA_CONSUMER_ERROR: &str = "sink_kafka_consumer_error_total";

/// Counter for rebalance events, labelled by event_type
pub const REBALANCE_EVENTS: &str = "sink_rebalance_total";

/// Counter for rebalance callbacks skipped because they carried no partitions
pub const REBALANCE_EMPTY_SKIPPED: &str = "sink_rebalance_empty_skipped_total";

/// Counter for buffered messages discarded because their partition was revoked
pub const REBALANCE_PURGED_MESSAGES: &str = "sink_rebalance_purged_messages_total";

/// Gauge for consumer lag per partition, taken from librdkafka statistics
pub const KAFKA_CONSUMER_LAG: &str = "sink_kafka_consumer_lag";

/// Gauge for the number of messages waiting in librdkafka's queues
pub const KAFKA_CONSUMER_QUEUED_MESSAGES: &str = "sink_kafka_consumer_queued_messages";

/// Gauge for the number of partitions assigned to this consumer
pub const KAFKA_ASSIGNED_PARTITIONS: &str = "sink_kafka_assigned_partitions";

// ==== Flush notifications ====
/// Counter for batches a handler could not enqueue without blocking
pub const FLUSH_HANDLER_QUEUE_FULL: &str = "flush_handler_queue_full_total";

/// Counter for batches accepted by a handler
pub const FLUSH_HANDLER_RECEIVED: &str = "flush_handler_received_total";

/// Counter for batches a handler's callback completed
pub const FLUSH_HANDLER_PROCESSED: &str = "flush_handler_processed_total";

/// Counter for batches whose callback failed or timed out
pub const FLUSH_HANDLER_FAILED: &str = "flush_handler_failed_total";

/// Counter for post-flush hand-offs that exceeded their timeout
pub const FLUSH_NOTIFICATION_TIMEOUT: &str = "flush_notification_timeout_total";

/// Counter for stored events per namespace and meter
pub const METERED_EVENTS: &str = "sink_metered_events_total";

// ==== Admin server ====
/// Counter for requests to the admin endpoints, labelled by method, path and status
pub const ADMIN_HTTP_REQUESTS: &str = "sink_admin_http_requests_total";

/// Histogram for admin request latency in seconds
pub const ADMIN_HTTP_REQUEST_DURATION: &str = "sink_admin_http_request_duration_seconds";
