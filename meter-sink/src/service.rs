use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::SinkBuffer;
use crate::config::{Config, DedupeMode};
use crate::dedupe::{Deduplicator, InMemoryDeduplicator, RedisDeduplicator};
use crate::health::HealthRegistry;
use crate::kafka::KafkaLogClient;
use crate::meter_cache::{MeterCache, StaticMeterLookup};
use crate::notification::{FlushEventHandlers, MeteredEventsCallback, QueuedFlushHandler};
use crate::sink::{NamespaceResolver, Sink};
use crate::storage::ClickHouseStorage;

/// Wires the sink to Kafka, ClickHouse, the dedupe store and the meter
/// definitions, and runs it until shutdown. The ingestion loop reports to
/// `liveness`.
pub struct SinkService {
    config: Config,
    liveness: HealthRegistry,
}

impl SinkService {
    pub fn new(config: Config, liveness: HealthRegistry) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer group '{}'",
                config.kafka_consumer_group
            )
        })?;
        Ok(Self { config, liveness })
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c, shutting down: {e}");
            }
        })
        .await
    }

    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let Self { config, liveness } = self;
        let shutdown = CancellationToken::new();

        let lookup = StaticMeterLookup::from_file(&config.meters_file)
            .with_context(|| format!("Failed to load meters from '{}'", config.meters_file))?;
        let meter_cache = Arc::new(MeterCache::new(
            Arc::new(lookup),
            config.meter_refetch_interval(),
            config.namespace_refetch_timeout(),
        ));
        meter_cache
            .start(shutdown.child_token())
            .await
            .context("Failed to load initial meter definitions")?;

        let storage = ClickHouseStorage::new(&config.to_clickhouse_config());
        if config.clickhouse_create_table {
            storage.ensure_table().await.with_context(|| {
                format!(
                    "Failed to prepare table '{}' at {}",
                    config.clickhouse_table, config.clickhouse_url
                )
            })?;
        }

        let deduplicator: Option<Arc<dyn Deduplicator>> = match config.dedupe_mode()? {
            DedupeMode::Disabled => None,
            DedupeMode::Memory => Some(Arc::new(InMemoryDeduplicator::new(
                config.dedupe_memory_capacity,
                config.dedupe_ttl(),
            ))),
            DedupeMode::Redis => Some(Arc::new(
                RedisDeduplicator::new(&config.redis_url, config.dedupe_ttl())
                    .await
                    .context("Failed to connect to the redis dedupe store")?,
            )),
        };

        let mut handlers = FlushEventHandlers::new();
        handlers.add(Arc::new(QueuedFlushHandler::new(
            "metered_events",
            config.notification_queue_size,
            config.notification_callback_timeout(),
            Arc::new(MeteredEventsCallback),
        )));

        let buffer = Arc::new(SinkBuffer::new());
        let log = KafkaLogClient::new(
            &config.to_consumer_config(),
            &config.namespace_topic_regexp,
            Arc::clone(&buffer),
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for pattern '{}' with group '{}'",
                config.namespace_topic_regexp, config.kafka_consumer_group
            )
        })?;

        let mut sink = Sink::new(
            config.to_sink_config()?,
            Arc::new(log),
            Arc::new(storage),
            Arc::clone(&meter_cache),
            NamespaceResolver::new(&config.namespace_topic_regexp)?,
        )?
        .with_buffer(buffer)
        .with_handlers(Arc::new(handlers))
        .with_health(liveness.register("sink", config.health_deadline()));
        if let Some(deduplicator) = deduplicator {
            sink = sink.with_deduplicator(deduplicator);
        }
        let sink = Arc::new(sink);

        info!(
            group = %config.kafka_consumer_group,
            pattern = %config.namespace_topic_regexp,
            dedupe = %config.dedupe_mode,
            "starting meter sink"
        );

        let mut sink_handle = tokio::spawn({
            let sink = Arc::clone(&sink);
            let shutdown = shutdown.clone();
            async move { sink.run(shutdown).await }
        });

        tokio::pin!(shutdown_signal);
        let joined = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("received shutdown signal, shutting down gracefully");
                shutdown.cancel();
                sink_handle.await
            }
            joined = &mut sink_handle => {
                shutdown.cancel();
                joined
            }
        };

        meter_cache.stopped().await;

        match joined {
            Ok(Ok(())) => {
                info!("meter sink stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow!(e).context("Sink stopped with a fatal error")),
            Err(e) => Err(anyhow!(e).context("Sink task panicked")),
        }
    }
}
