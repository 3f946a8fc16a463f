use async_trait::async_trait;

use crate::error::SinkError;
use crate::types::SinkMessage;

pub mod clickhouse;

pub use self::clickhouse::{ClickHouseStorage, EventRow};

/// Durable destination for validated events. A batch is either written
/// completely or the call fails.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn batch_insert(&self, messages: &[SinkMessage]) -> Result<(), SinkError>;
}
