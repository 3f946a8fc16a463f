use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::SinkError;
use crate::metrics_consts::{
    METER_CACHE_NAMESPACES, METER_CACHE_REFRESH, METER_CACHE_REJECTED_METERS,
};
use crate::types::Meter;
use crate::validator::CompiledMeter;

/// Source of meter definitions. `namespace = None` lists every namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeterLookup: Send + Sync {
    async fn list_meters(&self, namespace: Option<String>) -> Result<Vec<Meter>, SinkError>;
}

/// Meter definitions held in memory, typically loaded once from a JSON file
/// containing an array of meters.
#[derive(Debug, Clone, Default)]
pub struct StaticMeterLookup {
    meters: Vec<Meter>,
}

impl StaticMeterLookup {
    pub fn from_meters(meters: Vec<Meter>) -> Self {
        Self { meters }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SinkError::ConfigInvalid(format!("cannot read meters file {}: {e}", path.display()))
        })?;
        let meters: Vec<Meter> = serde_json::from_str(&raw).map_err(|e| {
            SinkError::ConfigInvalid(format!("cannot parse meters file {}: {e}", path.display()))
        })?;
        Ok(Self { meters })
    }
}

#[async_trait]
impl MeterLookup for StaticMeterLookup {
    async fn list_meters(&self, namespace: Option<String>) -> Result<Vec<Meter>, SinkError> {
        Ok(self
            .meters
            .iter()
            .filter(|m| namespace.as_deref().map_or(true, |ns| m.namespace == ns))
            .cloned()
            .collect())
    }
}

/// Immutable namespace -> event type -> meters view. Replaced wholesale on refresh.
#[derive(Debug, Default)]
pub struct MeterSnapshot {
    namespaces: HashMap<String, HashMap<String, Vec<CompiledMeter>>>,
    rejected: usize,
    generation: u64,
}

impl MeterSnapshot {
    /// Group `meters` by namespace and event type, compiling their JSON paths.
    /// A meter whose paths do not parse is left out, but its namespace is
    /// still known.
    pub fn from_meters(meters: Vec<Meter>, generation: u64) -> Self {
        let mut namespaces: HashMap<String, HashMap<String, Vec<CompiledMeter>>> = HashMap::new();
        let mut rejected = 0;

        for meter in meters {
            let by_type = namespaces.entry(meter.namespace.clone()).or_default();
            let (namespace, slug) = (meter.namespace.clone(), meter.slug.clone());
            match CompiledMeter::compile(meter) {
                Ok(compiled) => by_type
                    .entry(compiled.meter.event_type.clone())
                    .or_default()
                    .push(compiled),
                Err(e) => {
                    rejected += 1;
                    warn!(
                        namespace = %namespace,
                        slug = %slug,
                        error = ?e,
                        "skipping meter with an invalid json path"
                    );
                }
            }
        }

        Self {
            namespaces,
            rejected,
            generation,
        }
    }

    /// Meters of `namespace` counting `event_type`. `None` when the namespace
    /// is unknown, an empty slice when it has no meter for this event type.
    pub fn get_affected_meters(&self, namespace: &str, event_type: &str) -> Option<&[CompiledMeter]> {
        let by_type = self.namespaces.get(namespace)?;
        Some(by_type.get(event_type).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    /// How many meters were left out because their paths did not parse.
    pub fn rejected_meters(&self) -> usize {
        self.rejected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Idle,
    Starting,
    Running,
}

impl CacheState {
    fn as_str(&self) -> &'static str {
        match self {
            CacheState::Idle => "idle",
            CacheState::Starting => "starting",
            CacheState::Running => "running",
        }
    }
}

/// Periodically refreshed meter definitions shared between the ingestion
/// loop and the refresh task.
pub struct MeterCache {
    lookup: Arc<dyn MeterLookup>,
    snapshot: ArcSwap<MeterSnapshot>,
    generation: AtomicU64,
    refresh_interval: Duration,
    fetch_timeout: Duration,
    state: Mutex<CacheState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeterCache {
    pub fn new(
        lookup: Arc<dyn MeterLookup>,
        refresh_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            snapshot: ArcSwap::from_pointee(MeterSnapshot::default()),
            generation: AtomicU64::new(0),
            refresh_interval,
            fetch_timeout,
            state: Mutex::new(CacheState::Idle),
            task: Mutex::new(None),
        }
    }

    /// Load the initial snapshot, then keep refreshing it in the background
    /// until `shutdown` is cancelled. A failed initial load leaves the cache
    /// idle so startup can be retried.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), SinkError> {
        {
            let mut state = self.state.lock();
            if *state != CacheState::Idle {
                return Err(SinkError::IllegalState {
                    state: state.as_str(),
                    action: "start meter cache",
                });
            }
            *state = CacheState::Starting;
        }

        if let Err(e) = self.refresh().await {
            *self.state.lock() = CacheState::Idle;
            return Err(e);
        }

        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            cache.refresh_loop(shutdown).await;
        });

        *self.task.lock() = Some(handle);
        *self.state.lock() = CacheState::Running;
        Ok(())
    }

    async fn refresh_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and the initial load already happened
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("meter cache refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = ?e, "meter cache refresh failed, keeping previous snapshot");
                    }
                }
            }
        }
    }

    /// Fetch every meter and swap in a new snapshot. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, SinkError> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.lookup.list_meters(None)).await;

        let meters = match fetched {
            Ok(Ok(meters)) => meters,
            Ok(Err(e)) => {
                metrics::counter!(METER_CACHE_REFRESH, "status" => "error").increment(1);
                return Err(e);
            }
            Err(_) => {
                metrics::counter!(METER_CACHE_REFRESH, "status" => "timeout").increment(1);
                return Err(SinkError::transient(format!(
                    "meter lookup timed out after {:?}",
                    self.fetch_timeout
                )));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = MeterSnapshot::from_meters(meters, generation);
        let namespaces = snapshot.namespace_count();
        let rejected = snapshot.rejected_meters();
        self.snapshot.store(Arc::new(snapshot));

        metrics::counter!(METER_CACHE_REFRESH, "status" => "ok").increment(1);
        metrics::gauge!(METER_CACHE_NAMESPACES).set(namespaces as f64);
        metrics::gauge!(METER_CACHE_REJECTED_METERS).set(rejected as f64);
        debug!(generation, namespaces, "meter cache refreshed");

        Ok(namespaces)
    }

    /// The current snapshot. Hold on to it to validate one message against a
    /// single generation.
    pub fn snapshot(&self) -> Arc<MeterSnapshot> {
        self.snapshot.load_full()
    }

    /// Wait for the refresh task to finish after its shutdown token was cancelled.
    pub async fn stopped(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = ?e, "meter cache refresh task ended abnormally");
            }
        }
        *self.state.lock() = CacheState::Idle;
    }
}
