use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::SinkError;
use crate::kafka::ConsumerConfigBuilder;
use crate::sink::{ConsistencyPolicy, NamespaceResolver, SinkConfig};
use crate::storage::clickhouse::ClickHouseConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "om-sink")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Enables static group membership when set.
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "5000")]
    pub kafka_statistics_interval_ms: u32,

    /// Subscription pattern; the first capture group is the namespace.
    #[envconfig(default = "^om_([A-Za-z0-9]+(?:_[A-Za-z0-9]+)*)_events$")]
    pub namespace_topic_regexp: String,

    /// How often topic metadata is refreshed, which is how quickly new
    /// namespace topics are subscribed to.
    #[envconfig(default = "15")]
    pub namespace_refetch_secs: u64,

    #[envconfig(default = "10")]
    pub namespace_refetch_timeout_secs: u64,

    #[envconfig(default = "15")]
    pub meter_refetch_interval_secs: u64,

    // Batching
    #[envconfig(default = "500")]
    pub min_commit_count: usize,

    #[envconfig(default = "5000")]
    pub max_commit_wait_ms: u64,

    #[envconfig(default = "100")]
    pub max_poll_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub flush_success_timeout_ms: u64,

    #[envconfig(default = "10000")]
    pub drain_timeout_ms: u64,

    // Flush notifications
    #[envconfig(default = "1000")]
    pub notification_queue_size: usize,

    #[envconfig(default = "5000")]
    pub notification_callback_timeout_ms: u64,

    // Deduplication
    /// One of `none`, `memory` or `redis`.
    #[envconfig(default = "memory")]
    pub dedupe_mode: String,

    #[envconfig(default = "86400")]
    pub dedupe_ttl_secs: u64,

    #[envconfig(default = "100000")]
    pub dedupe_memory_capacity: u64,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "3")]
    pub dedupe_set_max_retries: u32,

    #[envconfig(default = "100")]
    pub dedupe_set_initial_backoff_ms: u64,

    #[envconfig(default = "commit_anyway")]
    pub consistency_policy: String,

    // ClickHouse
    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(default = "default")]
    pub clickhouse_database: String,

    #[envconfig(default = "default")]
    pub clickhouse_user: String,

    #[envconfig(default = "")]
    pub clickhouse_password: String,

    #[envconfig(default = "om_events")]
    pub clickhouse_table: String,

    #[envconfig(default = "true")]
    pub clickhouse_create_table: bool,

    // Meter definitions
    #[envconfig(default = "meters.json")]
    pub meters_file: String,

    // HTTP server
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    /// The ingestion loop is reported dead when it has not polled for this long.
    #[envconfig(default = "30")]
    pub health_deadline_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeMode {
    Disabled,
    Memory,
    Redis,
}

impl FromStr for DedupeMode {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "disabled" => Ok(DedupeMode::Disabled),
            "memory" => Ok(DedupeMode::Memory),
            "redis" => Ok(DedupeMode::Redis),
            other => Err(SinkError::ConfigInvalid(format!(
                "unknown dedupe mode: {other}"
            ))),
        }
    }
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        self.to_sink_config()?.validate()?;
        self.dedupe_mode()?;
        NamespaceResolver::new(&self.namespace_topic_regexp)?;

        if !self.namespace_topic_regexp.starts_with('^') {
            return Err(SinkError::ConfigInvalid(
                "namespace_topic_regexp must start with ^".to_string(),
            ));
        }
        if self.namespace_refetch_timeout_secs == 0 {
            return Err(SinkError::ConfigInvalid(
                "namespace_refetch_timeout must be greater than 0".to_string(),
            ));
        }
        if self.meter_refetch_interval_secs == 0 {
            return Err(SinkError::ConfigInvalid(
                "meter_refetch_interval must be greater than 0".to_string(),
            ));
        }
        if self.health_deadline_secs == 0 {
            return Err(SinkError::ConfigInvalid(
                "health_deadline must be greater than 0".to_string(),
            ));
        }
        if self.notification_queue_size == 0 {
            return Err(SinkError::ConfigInvalid(
                "notification_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.dedupe_mode()? != DedupeMode::Disabled && self.dedupe_ttl_secs == 0 {
            return Err(SinkError::ConfigInvalid(
                "dedupe_ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_deadline(&self) -> Duration {
        Duration::from_secs(self.health_deadline_secs)
    }

    pub fn dedupe_mode(&self) -> Result<DedupeMode, SinkError> {
        self.dedupe_mode.parse()
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }

    pub fn meter_refetch_interval(&self) -> Duration {
        Duration::from_secs(self.meter_refetch_interval_secs)
    }

    pub fn namespace_refetch_timeout(&self) -> Duration {
        Duration::from_secs(self.namespace_refetch_timeout_secs)
    }

    pub fn notification_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_callback_timeout_ms)
    }

    pub fn to_sink_config(&self) -> Result<SinkConfig, SinkError> {
        let consistency_policy: ConsistencyPolicy = self.consistency_policy.parse()?;

        Ok(SinkConfig {
            min_commit_count: self.min_commit_count,
            max_commit_wait: Duration::from_millis(self.max_commit_wait_ms),
            max_poll_timeout: Duration::from_millis(self.max_poll_timeout_ms),
            flush_success_timeout: Duration::from_millis(self.flush_success_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            dedupe_set_max_retries: self.dedupe_set_max_retries,
            dedupe_set_initial_backoff: Duration::from_millis(self.dedupe_set_initial_backoff_ms),
            consistency_policy,
        })
    }

    pub fn to_consumer_config(&self) -> ClientConfig {
        let refresh_ms = u32::try_from(self.namespace_refetch_secs.saturating_mul(1000))
            .unwrap_or(u32::MAX);

        ConsumerConfigBuilder::for_group_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .with_statistics_interval_ms(self.kafka_statistics_interval_ms)
            .with_topic_metadata_refresh_interval_ms(refresh_ms)
            .with_sticky_partition_assignment(self.kafka_client_id.as_deref())
            .build()
    }

    pub fn to_clickhouse_config(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.clickhouse_url.clone(),
            database: self.clickhouse_database.clone(),
            user: self.clickhouse_user.clone(),
            password: self.clickhouse_password.clone(),
            table: self.clickhouse_table.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config_with(&[]);
        config.validate().unwrap();

        let sink = config.to_sink_config().unwrap();
        assert_eq!(sink.min_commit_count, 500);
        assert_eq!(sink.max_commit_wait, Duration::from_secs(5));
        assert_eq!(sink.consistency_policy, ConsistencyPolicy::CommitAnyway);
        assert_eq!(config.dedupe_mode().unwrap(), DedupeMode::Memory);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.health_deadline(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let cases = [
            ("MIN_COMMIT_COUNT", "0"),
            ("DEDUPE_MODE", "postgres"),
            ("CONSISTENCY_POLICY", "yolo"),
            ("NAMESPACE_TOPIC_REGEXP", "om_(.+)_events"),
            ("NAMESPACE_TOPIC_REGEXP", "^om_.+_events$"),
            ("MAX_POLL_TIMEOUT_MS", "60000"),
            ("HEALTH_DEADLINE_SECS", "0"),
        ];

        for (key, value) in cases {
            let config = config_with(&[(key, value)]);
            assert!(
                matches!(config.validate(), Err(SinkError::ConfigInvalid(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_consumer_config() {
        let config = config_with(&[
            ("KAFKA_CLIENT_ID", "sink-0"),
            ("NAMESPACE_REFETCH_SECS", "30"),
        ]);

        let client = config.to_consumer_config();

        assert_eq!(client.get("group.id"), Some("om-sink"));
        assert_eq!(client.get("group.instance.id"), Some("sink-0"));
        assert_eq!(client.get("topic.metadata.refresh.interval.ms"), Some("30000"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
    }
}
