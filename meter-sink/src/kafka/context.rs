use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::buffer::SinkBuffer;
use crate::kafka::client::LogEvent;
use crate::metrics_consts::{
    KAFKA_ASSIGNED_PARTITIONS, KAFKA_CONSUMER_ERROR, KAFKA_CONSUMER_LAG,
    KAFKA_CONSUMER_QUEUED_MESSAGES, REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS,
};
use crate::rebalance::purge_revoked;
use crate::types::Partition;

pub type RebalanceSender = mpsc::UnboundedSender<LogEvent>;
pub type RebalanceReceiver = mpsc::UnboundedReceiver<LogEvent>;

/// Reacts to rebalances inside librdkafka's callbacks and forwards them to
/// the ingestion loop, which applies them under the sink lock.
///
/// Revoked partitions are purged from the buffer within the callback, so a
/// flush triggered by the record the same poll returns cannot touch them.
pub struct SinkConsumerContext {
    rebalance_tx: RebalanceSender,
    buffer: Arc<SinkBuffer>,
}

impl SinkConsumerContext {
    pub fn new(buffer: Arc<SinkBuffer>) -> (Self, RebalanceReceiver) {
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        (
            Self {
                rebalance_tx,
                buffer,
            },
            rebalance_rx,
        )
    }

    fn partitions(event_type: &'static str, list: &TopicPartitionList) -> Option<Vec<Partition>> {
        // cooperative-sticky triggers rebalances with no partition movement
        if list.count() == 0 {
            debug!("skipping empty {event_type} rebalance");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => event_type).increment(1);
            return None;
        }

        info!(event_type, partitions = list.count(), "rebalance");
        metrics::counter!(REBALANCE_EVENTS, "event_type" => event_type).increment(1);
        Some(list.elements().into_iter().map(Partition::from).collect())
    }

    fn on_revoke(&self, list: &TopicPartitionList) {
        let Some(partitions) = Self::partitions("revoke", list) else {
            return;
        };

        let purged = purge_revoked(&self.buffer, &partitions);
        debug!(purged, "purged revoked partitions from the buffer");
        self.forward("revoke", LogEvent::Revoked(partitions));
    }

    fn on_assign(&self, list: &TopicPartitionList) {
        if let Some(partitions) = Self::partitions("assign", list) {
            self.forward("assign", LogEvent::Assigned(partitions));
        }
    }

    fn forward(&self, event_type: &'static str, event: LogEvent) {
        if let Err(e) = self.rebalance_tx.send(event) {
            error!("failed to forward {event_type} rebalance to the ingestion loop: {e}");
        }
    }
}

impl ClientContext for SinkConsumerContext {
    fn stats(&self, stats: Statistics) {
        metrics::gauge!(KAFKA_CONSUMER_QUEUED_MESSAGES).set(stats.msg_cnt as f64);

        let mut assigned = 0;
        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                // librdkafka reports an internal partition -1 per topic
                if partition < 0 {
                    continue;
                }
                assigned += 1;
                metrics::gauge!(
                    KAFKA_CONSUMER_LAG,
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(partition_stats.consumer_lag as f64);
            }
        }
        metrics::gauge!(KAFKA_ASSIGNED_PARTITIONS).set(assigned as f64);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        let local = error
            .rdkafka_error_code()
            .map(|code| (code as i32) < 0)
            .unwrap_or(false);

        if local {
            warn!(error = ?error, "local kafka client error: {reason}");
            metrics::counter!(KAFKA_CONSUMER_ERROR, "source" => "client", "origin" => "local")
                .increment(1);
        } else {
            error!(error = ?error, "kafka client error: {reason}");
            metrics::counter!(KAFKA_CONSUMER_ERROR, "source" => "client", "origin" => "broker")
                .increment(1);
        }
    }
}

impl ConsumerContext for SinkConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.on_revoke(partitions),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!("pre-rebalance error: {e}"),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => self.on_assign(partitions),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!("post-rebalance error: {e}"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(partitions = offsets.count(), "committed offsets"),
            Err(e) => warn!("failed to commit offsets: {e}"),
        }
    }
}
