//! Event-level duplicate suppression across flushes and consumer restarts.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::retry::RetryPolicy;
use crate::types::DedupeIdentity;

pub mod memory;
pub mod redis;

pub use memory::InMemoryDeduplicator;
pub use self::redis::RedisDeduplicator;

#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// `true` when the identity has not been recorded yet.
    async fn check_unique(&self, identity: &DedupeIdentity) -> Result<bool, SinkError>;

    /// The subset of `identities` that has not been recorded yet.
    async fn check_unique_batch(
        &self,
        identities: &[DedupeIdentity],
    ) -> Result<HashSet<DedupeIdentity>, SinkError>;

    /// Record `identities`. Returns the ones that were already present.
    async fn set(&self, identities: &[DedupeIdentity]) -> Result<Vec<DedupeIdentity>, SinkError>;
}

/// [`Deduplicator::set`] with backoff between attempts.
pub async fn set_with_retry(
    deduplicator: &dyn Deduplicator,
    identities: &[DedupeIdentity],
    policy: &RetryPolicy,
) -> Result<Vec<DedupeIdentity>, SinkError> {
    if identities.is_empty() {
        return Ok(Vec::new());
    }
    policy
        .retry("dedupe_set", move || deduplicator.set(identities))
        .await
}
