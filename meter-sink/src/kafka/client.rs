use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message};

use crate::types::{LogCoordinate, Partition};

/// A data record read from the log, detached from the consumer's buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub coordinate: LogCoordinate,
    pub key: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp in unix milliseconds, when the record has one.
    pub timestamp_ms: Option<i64>,
}

impl LogRecord {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| h.value.map(|v| (h.key.to_string(), v.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            coordinate: LogCoordinate::new(
                Partition::new(message.topic(), message.partition()),
                message.offset(),
            ),
            key: message.key().map(<[u8]>::to_vec),
            headers,
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        }
    }
}

/// What a single poll can yield: a data record or a rebalance notification.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Record(LogRecord),
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

/// Consumer-side view of the partitioned log the sink reads from.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing arrived.
    async fn poll(&self, timeout: Duration) -> KafkaResult<Option<LogEvent>>;

    fn assignment(&self) -> KafkaResult<Vec<Partition>>;

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()>;

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()>;

    /// Mark the record at `coordinate` as processed. The next commit for its
    /// partition will point at `offset + 1`.
    fn store_offset(&self, coordinate: &LogCoordinate) -> KafkaResult<()>;

    /// Synchronously commit every stored offset.
    fn commit(&self) -> KafkaResult<()>;
}
