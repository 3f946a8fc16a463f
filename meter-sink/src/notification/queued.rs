use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SinkError;
use crate::metrics_consts::{
    FLUSH_HANDLER_FAILED, FLUSH_HANDLER_PROCESSED, FLUSH_HANDLER_QUEUE_FULL,
    FLUSH_HANDLER_RECEIVED,
};
use crate::notification::{DrainCallback, FlushCallback, FlushEventHandler, HandlerState};
use crate::types::FlushBatch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Flush handler with a bounded queue drained by a single worker task.
/// Callback failures and timeouts are logged and counted, never returned
/// to the flush that produced the batch.
#[derive(Clone)]
pub struct QueuedFlushHandler {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    callback: Arc<dyn FlushCallback>,
    callback_timeout: Duration,
    tx: mpsc::Sender<FlushBatch>,
    rx: Mutex<Option<mpsc::Receiver<FlushBatch>>>,
    state: Mutex<HandlerState>,
    closed: CancellationToken,
    drained: watch::Sender<bool>,
    drain_callbacks: Mutex<Vec<DrainCallback>>,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl QueuedFlushHandler {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        callback_timeout: Duration,
        callback: Arc<dyn FlushCallback>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (drained, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                callback,
                callback_timeout,
                tx,
                rx: Mutex::new(Some(rx)),
                state: Mutex::new(HandlerState::Idle),
                closed: CancellationToken::new(),
                drained,
                drain_callbacks: Mutex::new(Vec::new()),
                received: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> HandlerState {
        *self.inner.state.lock()
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            received: self.inner.received.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    fn rejected(&self) -> SinkError {
        SinkError::IllegalState {
            state: self.state().as_str(),
            action: "accept flush batch",
        }
    }
}

impl Inner {
    async fn run_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<FlushBatch>,
        shutdown: CancellationToken,
    ) {
        info!(handler = %self.name, "flush handler worker started");

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = shutdown.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => self.process(batch).await,
                    None => break,
                },
            }
        }

        // sends fail once the receiver is closed, so every accepted batch is buffered
        self.begin_draining();
        rx.close();
        while let Some(batch) = rx.recv().await {
            self.process(batch).await;
        }

        self.finish_draining();
        info!(handler = %self.name, "flush handler drained");
    }

    async fn process(&self, batch: FlushBatch) {
        let size = batch.len();
        match tokio::time::timeout(self.callback_timeout, self.callback.on_flush(batch)).await {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(FLUSH_HANDLER_PROCESSED, "handler" => self.name.clone())
                    .increment(1);
                debug!(handler = %self.name, size, "flush callback completed");
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(FLUSH_HANDLER_FAILED, "handler" => self.name.clone(), "reason" => "error")
                    .increment(1);
                error!(handler = %self.name, size, "flush callback failed: {e:#}");
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(FLUSH_HANDLER_FAILED, "handler" => self.name.clone(), "reason" => "timeout")
                    .increment(1);
                warn!(
                    handler = %self.name,
                    size,
                    timeout_ms = self.callback_timeout.as_millis() as u64,
                    "flush callback timed out"
                );
            }
        }
    }

    fn begin_draining(&self) {
        let mut state = self.state.lock();
        if *state == HandlerState::Running {
            *state = HandlerState::Draining;
        }
        drop(state);
        self.closed.cancel();
    }

    fn finish_draining(&self) {
        *self.state.lock() = HandlerState::Closed;

        let callbacks = {
            let mut callbacks = self.drain_callbacks.lock();
            self.drained.send_replace(true);
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl FlushEventHandler for QueuedFlushHandler {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self, shutdown: CancellationToken) -> Result<(), SinkError> {
        let mut state = self.inner.state.lock();
        let rx = match (*state, self.inner.rx.lock().take()) {
            (HandlerState::Idle, Some(rx)) => rx,
            (current, _) => {
                return Err(SinkError::IllegalState {
                    state: current.as_str(),
                    action: "start flush handler",
                })
            }
        };
        *state = HandlerState::Running;
        drop(state);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run_worker(rx, shutdown));
        Ok(())
    }

    async fn on_flush_success(&self, batch: FlushBatch) -> Result<(), SinkError> {
        if !matches!(self.state(), HandlerState::Idle | HandlerState::Running) {
            return Err(self.rejected());
        }

        match self.inner.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                metrics::counter!(FLUSH_HANDLER_QUEUE_FULL, "handler" => self.inner.name.clone())
                    .increment(1);
                warn!(handler = %self.inner.name, "flush handler queue is full, waiting for space");

                tokio::select! {
                    biased;
                    _ = self.inner.closed.cancelled() => return Err(self.rejected()),
                    sent = self.inner.tx.send(batch) => sent.map_err(|_| self.rejected())?,
                }
            }
            Err(TrySendError::Closed(_)) => return Err(self.rejected()),
        }

        self.inner.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(FLUSH_HANDLER_RECEIVED, "handler" => self.inner.name.clone())
            .increment(1);
        Ok(())
    }

    async fn wait_for_drain(&self) -> Result<(), SinkError> {
        if self.state() == HandlerState::Idle {
            return Err(SinkError::IllegalState {
                state: HandlerState::Idle.as_str(),
                action: "wait for drain",
            });
        }

        let mut drained = self.inner.drained.subscribe();
        drained
            .wait_for(|drained| *drained)
            .await
            .map(|_| ())
            .map_err(|_| SinkError::Notification {
                handler: self.inner.name.clone(),
                message: "drain signal dropped".to_string(),
            })
    }

    fn close(&self) -> Result<(), SinkError> {
        let mut state = self.inner.state.lock();
        match *state {
            HandlerState::Idle => {
                // no worker will ever drain the queue
                *state = HandlerState::Closed;
                drop(state);
                self.inner.closed.cancel();
                self.inner.finish_draining();
            }
            HandlerState::Running => {
                *state = HandlerState::Draining;
                drop(state);
                self.inner.closed.cancel();
            }
            HandlerState::Draining | HandlerState::Closed => {}
        }
        Ok(())
    }

    fn on_drain_complete(&self, callback: DrainCallback) {
        let mut callbacks = self.inner.drain_callbacks.lock();
        if *self.inner.drained.borrow() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(callback);
        }
    }
}
