use async_trait::async_trait;
use tracing::debug;

use crate::metrics_consts::METERED_EVENTS;
use crate::notification::FlushCallback;
use crate::types::FlushBatch;

/// Counts stored events per namespace and meter once they are durable.
/// Invalid events are stored too, but never counted towards a meter.
#[derive(Debug, Default)]
pub struct MeteredEventsCallback;

#[async_trait]
impl FlushCallback for MeteredEventsCallback {
    async fn on_flush(&self, batch: FlushBatch) -> anyhow::Result<()> {
        let mut counted = 0;
        for message in batch.iter().filter(|m| m.status().is_ok()) {
            for meter in &message.meters {
                metrics::counter!(
                    METERED_EVENTS,
                    "namespace" => message.namespace.clone(),
                    "meter" => meter.slug.clone()
                )
                .increment(1);
                counted += 1;
            }
        }
        debug!(batch = batch.len(), counted, "metered events counted");
        Ok(())
    }
}
