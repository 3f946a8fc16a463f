use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::dedupe::Deduplicator;
use crate::error::SinkError;
use crate::types::DedupeIdentity;

/// Process-local deduplicator. Keys expire after `ttl`, and the least
/// recently used keys are evicted beyond `max_capacity`.
pub struct InMemoryDeduplicator {
    seen: Cache<String, ()>,
}

impl InMemoryDeduplicator {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { seen }
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn check_unique(&self, identity: &DedupeIdentity) -> Result<bool, SinkError> {
        Ok(!self.seen.contains_key(&identity.key()))
    }

    async fn check_unique_batch(
        &self,
        identities: &[DedupeIdentity],
    ) -> Result<HashSet<DedupeIdentity>, SinkError> {
        Ok(identities
            .iter()
            .filter(|identity| !self.seen.contains_key(&identity.key()))
            .cloned()
            .collect())
    }

    async fn set(&self, identities: &[DedupeIdentity]) -> Result<Vec<DedupeIdentity>, SinkError> {
        let mut existing = Vec::new();
        for identity in identities {
            let entry = self.seen.entry(identity.key()).or_insert(()).await;
            if !entry.is_fresh() {
                existing.push(identity.clone());
            }
        }
        Ok(existing)
    }
}
