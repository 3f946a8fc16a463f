use async_trait::async_trait;
use chrono::Utc;
use ::clickhouse::{Client, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::storage::Storage;
use crate::types::SinkMessage;

/// One stored event. Times are unix milliseconds, matching `DateTime64(3)` columns.
#[derive(Row, Debug, Clone, PartialEq, Serialize)]
pub struct EventRow {
    pub namespace: String,
    pub validation_error: String,
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub subject: String,
    pub time: i64,
    pub data: String,
    pub ingested_at: i64,
    pub stored_at: i64,
}

impl EventRow {
    /// `None` for messages that never decoded into an envelope; those are
    /// not storable.
    pub fn from_message(message: &SinkMessage, stored_at_ms: i64) -> Option<Self> {
        let envelope = message.envelope.as_ref()?;
        Some(Self {
            namespace: message.namespace.clone(),
            validation_error: message
                .status()
                .validation_error()
                .unwrap_or_default()
                .to_string(),
            id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            source: envelope.source.clone(),
            subject: envelope.subject.clone(),
            time: envelope.time_millis(),
            data: envelope.data.clone(),
            ingested_at: message.ingested_at.timestamp_millis(),
            stored_at: stored_at_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub table: String,
}

pub struct ClickHouseStorage {
    client: Client,
    table: String,
}

impl ClickHouseStorage {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(config.url.clone())
            .with_database(config.database.clone())
            .with_user(config.user.clone())
            .with_password(config.password.clone());

        Self {
            client,
            table: config.table.clone(),
        }
    }

    /// Check connectivity and create the events table when it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), SinkError> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(|e| SinkError::persistence("failed to connect to clickhouse", e))?;

        self.client
            .query(&create_table_sql(&self.table))
            .execute()
            .await
            .map_err(|e| SinkError::persistence("failed to create events table", e))?;

        info!(table = %self.table, "clickhouse events table ready");
        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            namespace String,
            validation_error String,
            id String,
            type LowCardinality(String),
            source String,
            subject String,
            time DateTime64(3),
            data String,
            ingested_at DateTime64(3),
            stored_at DateTime64(3)
        )
        ENGINE = MergeTree
        PARTITION BY toYYYYMM(time)
        ORDER BY (namespace, type, subject, toStartOfHour(time))"
    )
}

#[async_trait]
impl Storage for ClickHouseStorage {
    async fn batch_insert(&self, messages: &[SinkMessage]) -> Result<(), SinkError> {
        let stored_at = Utc::now().timestamp_millis();
        let rows: Vec<EventRow> = messages
            .iter()
            .filter_map(|m| EventRow::from_message(m, stored_at))
            .collect();

        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self
            .client
            .insert::<EventRow>(&self.table)
            .map_err(|e| SinkError::persistence("failed to start insert", e))?;

        for row in &rows {
            insert
                .write(row)
                .await
                .map_err(|e| SinkError::persistence("failed to write row", e))?;
        }

        insert
            .end()
            .await
            .map_err(|e| SinkError::persistence("failed to finish insert", e))?;

        debug!(rows = rows.len(), table = %self.table, "inserted events");
        Ok(())
    }
}
