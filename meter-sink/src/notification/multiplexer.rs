use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::SinkError;
use crate::notification::{DrainCallback, FlushEventHandler};
use crate::types::FlushBatch;

/// Fans every call out to all registered handlers. Errors from individual
/// handlers are collected and returned together.
#[derive(Default, Clone)]
pub struct FlushEventHandlers {
    handlers: Vec<Arc<dyn FlushEventHandler>>,
}

impl FlushEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: Arc<dyn FlushEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl FlushEventHandler for FlushEventHandlers {
    fn name(&self) -> &str {
        "flush_event_handlers"
    }

    fn start(&self, shutdown: CancellationToken) -> Result<(), SinkError> {
        let errors = self
            .handlers
            .iter()
            .filter_map(|h| h.start(shutdown.clone()).err())
            .collect();
        SinkError::join(errors)
    }

    async fn on_flush_success(&self, batch: FlushBatch) -> Result<(), SinkError> {
        let results = join_all(
            self.handlers
                .iter()
                .map(|h| h.on_flush_success(Arc::clone(&batch))),
        )
        .await;
        SinkError::join(results.into_iter().filter_map(Result::err).collect())
    }

    async fn wait_for_drain(&self) -> Result<(), SinkError> {
        let results = join_all(self.handlers.iter().map(|h| h.wait_for_drain())).await;
        SinkError::join(results.into_iter().filter_map(Result::err).collect())
    }

    fn close(&self) -> Result<(), SinkError> {
        let errors = self
            .handlers
            .iter()
            .filter_map(|h| h.close().err())
            .collect();
        SinkError::join(errors)
    }

    /// `callback` fires once, after every handler has drained.
    fn on_drain_complete(&self, callback: DrainCallback) {
        if self.handlers.is_empty() {
            callback();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(self.handlers.len()));
        let callback = Arc::new(Mutex::new(Some(callback)));
        for handler in &self.handlers {
            let remaining = Arc::clone(&remaining);
            let callback = Arc::clone(&callback);
            handler.on_drain_complete(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(callback) = callback.lock().take() {
                        callback();
                    }
                }
            }));
        }
    }
}
