//! Post-flush notifications.
//!
//! Every successfully persisted batch is handed to the registered
//! [`FlushEventHandler`]s. Handlers queue batches and run their callback on
//! a worker of their own, so a slow consumer never holds up a flush.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SinkError;
use crate::types::FlushBatch;

pub mod metering;
pub mod multiplexer;
pub mod queued;

pub use metering::MeteredEventsCallback;
pub use multiplexer::FlushEventHandlers;
pub use queued::{HandlerStats, QueuedFlushHandler};

pub type DrainCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Running,
    Draining,
    Closed,
}

impl HandlerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerState::Idle => "idle",
            HandlerState::Running => "running",
            HandlerState::Draining => "draining",
            HandlerState::Closed => "closed",
        }
    }
}

#[async_trait]
pub trait FlushEventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the worker. Cancelling `shutdown` has the same effect as [`close`](Self::close).
    fn start(&self, shutdown: CancellationToken) -> Result<(), SinkError>;

    /// Queue a persisted batch. Waits for queue space only when the queue is full.
    async fn on_flush_success(&self, batch: FlushBatch) -> Result<(), SinkError>;

    /// Resolve once every batch queued before shutdown has been processed.
    async fn wait_for_drain(&self) -> Result<(), SinkError>;

    /// Stop accepting batches and unblock anyone waiting for queue space.
    fn close(&self) -> Result<(), SinkError>;

    /// Register a callback fired exactly once, after the queue has drained.
    fn on_drain_complete(&self, callback: DrainCallback);
}

/// The work a [`QueuedFlushHandler`] performs for each batch.
#[async_trait]
pub trait FlushCallback: Send + Sync {
    async fn on_flush(&self, batch: FlushBatch) -> anyhow::Result<()>;
}
