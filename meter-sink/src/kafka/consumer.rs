use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::buffer::SinkBuffer;
use crate::error::SinkError;
use crate::kafka::client::{LogClient, LogEvent, LogRecord};
use crate::kafka::context::{RebalanceReceiver, SinkConsumerContext};
use crate::metrics_consts::KAFKA_CONSUMER_ERROR;
use crate::types::{LogCoordinate, Partition};

/// [`LogClient`] backed by an rdkafka group consumer subscribed to a topic pattern.
pub struct KafkaLogClient {
    consumer: StreamConsumer<SinkConsumerContext>,
    rebalances: Mutex<RebalanceReceiver>,
}

impl KafkaLogClient {
    /// `topic_pattern` is passed to librdkafka as a regex subscription, so
    /// it has to start with `^`. `buffer` is the sink's buffer, purged of
    /// revoked partitions from within the rebalance callback.
    pub fn new(
        config: &ClientConfig,
        topic_pattern: &str,
        buffer: Arc<SinkBuffer>,
    ) -> Result<Self, SinkError> {
        if !topic_pattern.starts_with('^') {
            return Err(SinkError::ConfigInvalid(format!(
                "topic pattern must start with ^ to be used as a subscription: {topic_pattern}"
            )));
        }

        let (context, rebalances) = SinkConsumerContext::new(buffer);
        let consumer: StreamConsumer<SinkConsumerContext> =
            config.create_with_context(context)?;
        consumer.subscribe(&[topic_pattern])?;

        info!(topic_pattern, "subscribed to namespace topics");

        Ok(Self {
            consumer,
            rebalances: Mutex::new(rebalances),
        })
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

#[async_trait]
impl LogClient for KafkaLogClient {
    async fn poll(&self, timeout: Duration) -> KafkaResult<Option<LogEvent>> {
        let mut rebalances = self.rebalances.lock().await;

        // rebalances are handled before any record delivered after them
        if let Ok(event) = rebalances.try_recv() {
            return Ok(Some(event));
        }

        tokio::select! {
            biased;

            Some(event) = rebalances.recv() => Ok(Some(event)),

            received = tokio::time::timeout(timeout, self.consumer.recv()) => match received {
                Err(_) => Ok(None),
                Ok(Ok(message)) => Ok(Some(LogEvent::Record(LogRecord::from_borrowed(&message)))),
                Ok(Err(e)) => Err(e),
            },
        }
    }

    fn assignment(&self) -> KafkaResult<Vec<Partition>> {
        Ok(self
            .consumer
            .assignment()?
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect())
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.resume(&partition_list(partitions))
    }

    fn store_offset(&self, coordinate: &LogCoordinate) -> KafkaResult<()> {
        let mut list = TopicPartitionList::with_capacity(1);
        list.add_partition_offset(
            coordinate.topic(),
            coordinate.partition_number(),
            Offset::Offset(coordinate.offset() + 1),
        )?;
        self.consumer.store_offsets(&list)
    }

    fn commit(&self) -> KafkaResult<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            // nothing stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other,
        }
    }
}

/// Where a failed poll came from. Decides how loudly it is reported and
/// whether the ingestion loop may carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorOrigin {
    /// Raised inside librdkafka (negative error codes), e.g. brokers unreachable.
    Local,
    /// Reported by a broker.
    Broker,
    /// The consumer cannot make progress any more.
    Fatal,
}

impl PollErrorOrigin {
    pub fn of(error: &KafkaError) -> Self {
        match error {
            KafkaError::MessageConsumptionFatal(_)
            | KafkaError::Canceled
            | KafkaError::Global(RDKafkaErrorCode::Authentication) => PollErrorOrigin::Fatal,
            other => match other.rdkafka_error_code() {
                Some(code) if (code as i32) < 0 => PollErrorOrigin::Local,
                _ => PollErrorOrigin::Broker,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollErrorOrigin::Local => "local",
            PollErrorOrigin::Broker => "broker",
            PollErrorOrigin::Fatal => "fatal",
        }
    }
}

/// Report a failed poll and turn it into a [`SinkError`]: [`SinkError::Kafka`]
/// when consumption has to stop, [`SinkError::Transient`] otherwise.
pub fn classify_poll_error(error: KafkaError) -> SinkError {
    let origin = PollErrorOrigin::of(&error);
    metrics::counter!(KAFKA_CONSUMER_ERROR, "source" => "poll", "origin" => origin.as_str())
        .increment(1);

    match origin {
        PollErrorOrigin::Local => {
            warn!(error = ?error, "local consumer error, polling again");
            SinkError::Transient {
                message: "local consumer error".to_string(),
                source: Some(Box::new(error)),
            }
        }
        PollErrorOrigin::Broker => {
            error!(error = ?error, "broker reported a consumer error, polling again");
            SinkError::Transient {
                message: "broker consumer error".to_string(),
                source: Some(Box::new(error)),
            }
        }
        PollErrorOrigin::Fatal => {
            error!(error = ?error, "consumer cannot continue");
            SinkError::Kafka(error)
        }
    }
}

/// Pause before polling again after `consecutive` failed polls in a row.
pub fn poll_backoff(consecutive: u32) -> Duration {
    POLL_BACKOFF_STEP
        .saturating_mul(consecutive.max(1))
        .min(POLL_BACKOFF_MAX)
}

const POLL_BACKOFF_STEP: Duration = Duration::from_millis(200);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(5);
