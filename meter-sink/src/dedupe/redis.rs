use std::collections::HashSet;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use tracing::info;

use crate::dedupe::Deduplicator;
use crate::error::SinkError;
use crate::types::DedupeIdentity;

/// Deduplicator shared by every sink replica. Each key is written with
/// `SET key "" NX EX ttl`, so the store itself tells us which keys existed.
pub struct RedisDeduplicator {
    connection: MultiplexedConnection,
    ttl_seconds: u64,
}

impl RedisDeduplicator {
    pub async fn new(url: &str, ttl: Duration) -> Result<Self, SinkError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| SinkError::dedupe("invalid redis url", e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SinkError::dedupe("failed to connect to redis", e))?;

        info!(ttl_seconds = ttl.as_secs(), "connected to redis deduplication store");

        Ok(Self {
            connection,
            ttl_seconds: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn check_unique(&self, identity: &DedupeIdentity) -> Result<bool, SinkError> {
        let mut conn = self.connection.clone();
        let exists: bool = ::redis::cmd("EXISTS")
            .arg(identity.key())
            .query_async(&mut conn)
            .await
            .map_err(|e| SinkError::dedupe("redis EXISTS failed", e))?;
        Ok(!exists)
    }

    async fn check_unique_batch(
        &self,
        identities: &[DedupeIdentity],
    ) -> Result<HashSet<DedupeIdentity>, SinkError> {
        if identities.is_empty() {
            return Ok(HashSet::new());
        }

        let mut pipe = ::redis::pipe();
        for identity in identities {
            pipe.cmd("EXISTS").arg(identity.key());
        }

        let mut conn = self.connection.clone();
        let exists: Vec<bool> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SinkError::dedupe("redis EXISTS pipeline failed", e))?;

        Ok(identities
            .iter()
            .zip(exists)
            .filter(|(_, exists)| !exists)
            .map(|(identity, _)| identity.clone())
            .collect())
    }

    async fn set(&self, identities: &[DedupeIdentity]) -> Result<Vec<DedupeIdentity>, SinkError> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for identity in identities {
            pipe.cmd("SET")
                .arg(identity.key())
                .arg("")
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_seconds);
        }

        let mut conn = self.connection.clone();
        let results: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SinkError::dedupe("redis SET pipeline failed", e))?;

        // a nil reply means NX refused the write because the key was already there
        Ok(identities
            .iter()
            .zip(results)
            .filter(|(_, reply)| reply.is_none())
            .map(|(identity, _)| identity.clone())
            .collect())
    }
}
