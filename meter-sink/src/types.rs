use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Address of one record in the source log. Ordering is topic, then
/// partition, then offset, so sorting a batch yields ascending offsets
/// within every partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogCoordinate {
    partition: Partition,
    offset: i64,
}

impl LogCoordinate {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for LogCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// CloudEvents-shaped payload as produced onto the ingest topics.
/// `time` is unix seconds and `data` carries the raw JSON payload as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    /// Structural check only: every required attribute has to be present.
    pub fn validate(&self) -> Result<(), SinkError> {
        let missing = [
            ("id", self.id.is_empty()),
            ("type", self.event_type.is_empty()),
            ("source", self.source.is_empty()),
            ("subject", self.subject.is_empty()),
            ("time", self.time == 0),
        ];

        match missing.iter().find(|(_, is_missing)| *is_missing) {
            Some((field, _)) => Err(SinkError::Validation(format!(
                "event is missing required attribute: {field}"
            ))),
            None => Ok(()),
        }
    }

    pub fn time_millis(&self) -> i64 {
        self.time.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Stored, and its dedupe identity recorded after a successful flush.
    Ok,
    /// Never stored. The offset is still committed.
    Drop { reason: String },
    /// Stored together with the validation error.
    Invalid { error: String },
}

impl ProcessingStatus {
    pub fn drop(reason: impl Into<String>) -> Self {
        ProcessingStatus::Drop {
            reason: reason.into(),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        ProcessingStatus::Invalid {
            error: error.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessingStatus::Ok => "ok",
            ProcessingStatus::Drop { .. } => "drop",
            ProcessingStatus::Invalid { .. } => "invalid",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProcessingStatus::Ok)
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, ProcessingStatus::Drop { .. })
    }

    pub fn validation_error(&self) -> Option<&str> {
        match self {
            ProcessingStatus::Invalid { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    UniqueCount,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub namespace: String,
    pub slug: String,
    pub event_type: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub value_property: Option<String>,
    #[serde(default)]
    pub group_by: BTreeMap<String, String>,
}

/// Application-level identity of an event, independent of where it sits in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeIdentity {
    pub namespace: String,
    pub id: String,
    pub source: String,
}

impl DedupeIdentity {
    pub fn new(
        namespace: impl Into<String>,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            source: source.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.namespace, self.source, self.id)
    }
}

/// One ingested record on its way through the pipeline.
#[derive(Debug, Clone)]
pub struct SinkMessage {
    pub namespace: String,
    pub coordinate: LogCoordinate,
    pub envelope: Option<Envelope>,
    pub meters: Vec<Meter>,
    /// Broker timestamp of the record, falling back to when we received it.
    pub ingested_at: DateTime<Utc>,
    status: ProcessingStatus,
    status_decided: bool,
}

impl SinkMessage {
    pub fn new(coordinate: LogCoordinate, ingested_at: DateTime<Utc>) -> Self {
        Self {
            namespace: String::new(),
            coordinate,
            envelope: None,
            meters: Vec::new(),
            ingested_at,
            status: ProcessingStatus::Ok,
            status_decided: false,
        }
    }

    pub fn status(&self) -> &ProcessingStatus {
        &self.status
    }

    /// The first decision wins; later calls within the same cycle are ignored.
    pub fn set_status(&mut self, status: ProcessingStatus) {
        if self.status_decided {
            return;
        }
        self.status = status;
        self.status_decided = true;
    }

    pub fn identity(&self) -> Option<DedupeIdentity> {
        self.envelope
            .as_ref()
            .map(|e| DedupeIdentity::new(self.namespace.clone(), e.id.clone(), e.source.clone()))
    }
}

/// Messages handed to flush handlers once they are durably stored.
pub type FlushBatch = Arc<Vec<SinkMessage>>;
