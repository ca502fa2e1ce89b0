//! Model registry: lifecycle state and transitions for every known model
//!
//! The registry is built once from a catalog of [`ModelDescriptor`]s and never
//! gains or loses entries afterwards. Each entry owns a [`watch`] channel
//! holding its current [`Slot`]; the channel's lock is the per-model token.
//! Transitions are decided under that lock and then carried out without it,
//! so [`ModelRegistry::list`] never waits on a load or unload in progress.
//!
//! Loads and unloads run in their own tasks. A caller that gives up waiting
//! (for example because of a request timeout) does not abort the transition,
//! and every other caller waiting on the same model still sees it finish.

use crate::adapters::{AdapterFactory, ModelAdapter};
use crate::config::{Device, Precision};
use crate::error::{BgServeError, Result};
use crate::gate::AcceleratorGate;
use crate::models::{AdapterMetadata, ModelDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of a registered model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl ModelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one registry entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub descriptor: ModelDescriptor,
    pub state: ModelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AdapterMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    /// Requests currently holding the model
    pub in_flight: usize,
}

impl ModelStatus {
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state == ModelState::Ready
    }

    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.metadata.as_ref().map(|m| m.device)
    }

    #[must_use]
    pub fn precision(&self) -> Option<Precision> {
        self.metadata.as_ref().map(|m| m.precision)
    }
}

/// Device and precision every model is loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub device: Device,
    pub precision: Precision,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::Full,
        }
    }
}

enum Slot {
    Unloaded,
    /// Load attempt number
    Loading(u64),
    Ready(Arc<LoadedModel>),
    Unloading,
    Failed(String),
}

impl Slot {
    fn state(&self) -> ModelState {
        match self {
            Self::Unloaded => ModelState::Unloaded,
            Self::Loading(_) => ModelState::Loading,
            Self::Ready(_) => ModelState::Ready,
            Self::Unloading => ModelState::Unloading,
            Self::Failed(_) => ModelState::Failed,
        }
    }
}

struct ModelEntry {
    descriptor: ModelDescriptor,
    slot: watch::Sender<Slot>,
    attempts: AtomicU64,
    /// Most recent failed attempt, kept after an unload resets the slot
    last_failure: StdMutex<Option<(u64, String)>>,
}

impl ModelEntry {
    fn new(descriptor: ModelDescriptor) -> Self {
        let (slot, _) = watch::channel(Slot::Unloaded);
        Self {
            descriptor,
            slot,
            attempts: AtomicU64::new(0),
            last_failure: StdMutex::new(None),
        }
    }

    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn record_failure(&self, attempt: u64, message: &str) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((attempt, message.to_string()));
    }

    fn failure_of(&self, attempt: u64) -> Option<String> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(failed, _)| *failed == attempt)
            .map(|(_, message)| message.clone())
    }
}

/// A prepared adapter owned by a `Ready` registry entry
struct LoadedModel {
    id: String,
    adapter: Arc<Mutex<Box<dyn ModelAdapter>>>,
    metadata: AdapterMetadata,
    loaded_at: DateTime<Utc>,
    created: Instant,
    /// Milliseconds after `created` when the model was last released by a request
    last_used_ms: AtomicU64,
    leases: AtomicUsize,
    drained: Notify,
}

impl LoadedModel {
    fn new(id: String, adapter: Box<dyn ModelAdapter>) -> Self {
        let metadata = adapter.metadata();
        Self {
            id,
            adapter: Arc::new(Mutex::new(adapter)),
            metadata,
            loaded_at: Utc::now(),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last_used)
    }

    fn in_flight(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a ready model from being unloaded while a request uses it
///
/// Dropping the lease records the model as used and lets a pending unload
/// proceed once no other lease remains.
pub struct ModelLease {
    model: Arc<LoadedModel>,
}

impl ModelLease {
    fn new(model: Arc<LoadedModel>) -> Self {
        model.leases.fetch_add(1, Ordering::AcqRel);
        Self { model }
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model.id
    }

    #[must_use]
    pub fn metadata(&self) -> &AdapterMetadata {
        &self.model.metadata
    }

    /// The adapter; lock it for the duration of one `run`
    #[must_use]
    pub fn adapter(&self) -> Arc<Mutex<Box<dyn ModelAdapter>>> {
        Arc::clone(&self.model.adapter)
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model", &self.model.id)
            .finish_non_exhaustive()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let elapsed = self.model.created.elapsed().as_millis() as u64;
        self.model.last_used_ms.fetch_max(elapsed, Ordering::AcqRel);
        if self.model.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.model.drained.notify_waiters();
        }
    }
}

/// Marks a load as failed if its task ends without committing a result
struct LoadGuard {
    entry: Arc<ModelEntry>,
    attempt: u64,
    committed: bool,
}

impl LoadGuard {
    fn commit(mut self, slot: Slot) {
        if let Slot::Failed(message) = &slot {
            self.entry.record_failure(self.attempt, message);
        }
        self.entry.slot.send_replace(slot);
        self.committed = true;
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.committed {
            warn!(model = %self.entry.id(), "model load aborted");
            let message = "model load was aborted".to_string();
            self.entry.record_failure(self.attempt, &message);
            self.entry.slot.send_replace(Slot::Failed(message));
        }
    }
}

enum Next {
    Lease(ModelLease),
    StartLoad(u64),
    Fail(String),
    Wait,
}

/// Process-wide catalog of models and their lifecycle state
pub struct ModelRegistry {
    entries: Vec<Arc<ModelEntry>>,
    index: HashMap<String, usize>,
    factory: Arc<dyn AdapterFactory>,
    gate: AcceleratorGate,
    placement: Placement,
    unload_timeout: Duration,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.index.keys().collect::<Vec<_>>())
            .field("gate", &self.gate)
            .field("placement", &self.placement)
            .field("unload_timeout", &self.unload_timeout)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Register every descriptor in `catalog` as `Unloaded`
    ///
    /// # Errors
    /// - Duplicate or empty model ids
    pub fn new(
        catalog: Vec<ModelDescriptor>,
        factory: Arc<dyn AdapterFactory>,
        gate: AcceleratorGate,
        placement: Placement,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(catalog.len());
        let mut index = HashMap::with_capacity(catalog.len());
        for descriptor in catalog {
            if descriptor.id.trim().is_empty() {
                return Err(BgServeError::invalid_config("model id must not be empty"));
            }
            if index.insert(descriptor.id.clone(), entries.len()).is_some() {
                return Err(BgServeError::invalid_config(format!(
                    "model '{}' is registered twice",
                    descriptor.id
                )));
            }
            entries.push(Arc::new(ModelEntry::new(descriptor)));
        }

        Ok(Self {
            entries,
            index,
            factory,
            gate,
            placement,
            unload_timeout: Duration::from_secs(30),
        })
    }

    /// How long `unload` waits for in-flight requests before failing
    #[must_use]
    pub fn with_unload_timeout(mut self, timeout: Duration) -> Self {
        self.unload_timeout = timeout;
        self
    }

    #[must_use]
    pub fn gate(&self) -> &AcceleratorGate {
        &self.gate
    }

    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Registered descriptor for `id`
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown id
    pub fn descriptor(&self, id: &str) -> Result<&ModelDescriptor> {
        self.entry(id).map(|entry| &entry.descriptor)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn entry(&self, id: &str) -> Result<&Arc<ModelEntry>> {
        self.index
            .get(id)
            .and_then(|i| self.entries.get(*i))
            .ok_or_else(|| BgServeError::model_not_found(id))
    }

    /// Snapshot of every model in registration order
    #[must_use]
    pub fn list(&self) -> Vec<ModelStatus> {
        self.entries.iter().map(|entry| Self::status(entry)).collect()
    }

    /// Snapshot of one model
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown id
    pub fn status_of(&self, id: &str) -> Result<ModelStatus> {
        self.entry(id).map(|entry| Self::status(entry))
    }

    fn status(entry: &ModelEntry) -> ModelStatus {
        let slot = entry.slot.borrow();
        let mut status = ModelStatus {
            descriptor: entry.descriptor.clone(),
            state: slot.state(),
            metadata: None,
            last_error: None,
            loaded_at: None,
            in_flight: 0,
        };
        match &*slot {
            Slot::Ready(model) => {
                status.metadata = Some(model.metadata.clone());
                status.loaded_at = Some(model.loaded_at);
                status.in_flight = model.in_flight();
            },
            Slot::Failed(message) => status.last_error = Some(message.clone()),
            Slot::Unloaded | Slot::Loading(_) | Slot::Unloading => {},
        }
        status
    }

    /// Return a lease on the ready model, loading it first if needed
    ///
    /// Concurrent callers for the same model share one load; all of them see
    /// the same adapter or the same failure. A model that previously failed is
    /// retried by the next caller that did not take part in the failed load.
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown id
    /// - `ModelLoadFailed` when staging or preparing the adapter fails
    #[instrument(skip(self), level = "debug")]
    pub async fn get_or_load(&self, id: &str) -> Result<ModelLease> {
        let entry = self.entry(id)?;
        // Load attempt this caller started or waited on
        let mut joined: Option<u64> = None;
        loop {
            let mut changes = entry.slot.subscribe();
            let mut next = Next::Wait;
            entry.slot.send_if_modified(|slot| match slot {
                Slot::Ready(model) => {
                    next = Next::Lease(ModelLease::new(Arc::clone(model)));
                    false
                },
                Slot::Failed(message) if joined.is_some() => {
                    next = Next::Fail(message.clone());
                    false
                },
                Slot::Unloaded | Slot::Failed(_) => {
                    // An unload may have reset the slot before this waiter saw
                    // the failure of the attempt it joined
                    if let Some(message) = joined.and_then(|attempt| entry.failure_of(attempt)) {
                        next = Next::Fail(message);
                        return false;
                    }
                    let attempt = entry.next_attempt();
                    *slot = Slot::Loading(attempt);
                    joined = Some(attempt);
                    next = Next::StartLoad(attempt);
                    true
                },
                Slot::Loading(attempt) => {
                    joined = Some(*attempt);
                    false
                },
                Slot::Unloading => false,
            });

            match next {
                Next::Lease(lease) => return Ok(lease),
                Next::Fail(message) => {
                    return Err(BgServeError::model_load_failed(id, message));
                },
                Next::StartLoad(attempt) => {
                    self.spawn_load(Arc::clone(entry), attempt);
                },
                Next::Wait => debug!(model = id, "waiting for model transition"),
            }

            changes
                .changed()
                .await
                .map_err(|_| BgServeError::internal("model state channel closed"))?;
        }
    }

    fn spawn_load(&self, entry: Arc<ModelEntry>, attempt: u64) {
        let factory = Arc::clone(&self.factory);
        let gate = self.gate.clone();
        let Placement { device, precision } = self.placement;

        tokio::spawn(async move {
            let guard = LoadGuard {
                entry: Arc::clone(&entry),
                attempt,
                committed: false,
            };
            let started = Instant::now();
            info!(model = %entry.id(), %device, %precision, "loading model");

            let result = async {
                let mut adapter = factory.create(&entry.descriptor)?;
                adapter.stage(device, precision).await?;
                let exclusive = gate.exclusive().await?;
                adapter.prepare(device, precision).await?;
                exclusive.release();
                Ok::<_, BgServeError>(adapter)
            }
            .await;

            match result {
                Ok(adapter) => {
                    let model = LoadedModel::new(entry.id().to_string(), adapter);
                    info!(
                        model = %entry.id(),
                        device = %model.metadata.device,
                        precision = %model.metadata.precision,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "model ready"
                    );
                    guard.commit(Slot::Ready(Arc::new(model)));
                },
                Err(e) => {
                    let message = match e {
                        BgServeError::ModelLoadFailed { message, .. } => message,
                        other => other.to_string(),
                    };
                    warn!(model = %entry.id(), error = %message, "model load failed");
                    guard.commit(Slot::Failed(message));
                },
            }
        });
    }

    /// Release a model's adapter and return it to `Unloaded`
    ///
    /// Waits up to the unload timeout for in-flight requests to finish. A
    /// model still loading is unloaded once the load completes. Unloading an
    /// unloaded model is a no-op; a failed model is reset to `Unloaded`.
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown id
    /// - `ModelBusy` when requests are still in flight after the timeout
    #[instrument(skip(self), level = "debug")]
    pub async fn unload(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        self.unload_entry(entry, |_| true).await.map(|_| ())
    }

    /// Unload `id` only if it is ready, unused and idle for at least `ttl`
    ///
    /// Returns whether the model was unloaded.
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown id
    pub async fn unload_if_idle(&self, id: &str, ttl: Duration) -> Result<bool> {
        let entry = self.entry(id)?;
        self.unload_entry(entry, |model| model.in_flight() == 0 && model.idle_for() >= ttl)
            .await
    }

    /// Ids of ready models with no requests in flight
    #[must_use]
    pub fn idle_models(&self, ttl: Duration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| match &*entry.slot.borrow() {
                Slot::Ready(model) => model.in_flight() == 0 && model.idle_for() >= ttl,
                _ => false,
            })
            .map(|entry| entry.id().to_string())
            .collect()
    }

    async fn unload_entry<F>(&self, entry: &Arc<ModelEntry>, should_unload: F) -> Result<bool>
    where
        F: Fn(&LoadedModel) -> bool,
    {
        let model = loop {
            let mut changes = entry.slot.subscribe();
            let mut model = None;
            let mut done = false;
            entry.slot.send_if_modified(|slot| match slot {
                Slot::Ready(ready) if should_unload(ready.as_ref()) => {
                    model = Some(Arc::clone(ready));
                    *slot = Slot::Unloading;
                    true
                },
                Slot::Ready(_) | Slot::Unloaded => {
                    done = true;
                    false
                },
                Slot::Failed(_) => {
                    *slot = Slot::Unloaded;
                    done = true;
                    true
                },
                Slot::Loading(_) | Slot::Unloading => false,
            });

            if let Some(model) = model {
                break model;
            }
            if done {
                return Ok(false);
            }
            changes
                .changed()
                .await
                .map_err(|_| BgServeError::internal("model state channel closed"))?;
        };

        let task = tokio::spawn(Self::finish_unload(
            Arc::clone(entry),
            model,
            self.gate.clone(),
            self.unload_timeout,
        ));
        task.await
            .map_err(|e| BgServeError::internal(format!("unload task failed: {e}")))??;
        Ok(true)
    }

    async fn finish_unload(
        entry: Arc<ModelEntry>,
        model: Arc<LoadedModel>,
        gate: AcceleratorGate,
        timeout: Duration,
    ) -> Result<()> {
        if tokio::time::timeout(timeout, model.wait_drained())
            .await
            .is_err()
        {
            let in_flight = model.in_flight();
            warn!(model = %entry.id(), in_flight, "unload timed out waiting for requests");
            entry.slot.send_replace(Slot::Ready(model));
            return Err(BgServeError::ModelBusy {
                model: entry.id().to_string(),
                in_flight,
            });
        }

        let released = async {
            // Adapter before gate slots, the order inference takes them in
            let mut adapter = model.adapter.lock().await;
            let exclusive = gate.exclusive().await?;
            adapter.release();
            exclusive.release();
            Ok::<_, BgServeError>(())
        }
        .await;

        // The adapter is unusable after a partial release either way
        entry.slot.send_replace(Slot::Unloaded);
        released?;
        info!(model = %entry.id(), "model unloaded");
        Ok(())
    }

    /// Give cached accelerator memory back from every ready model
    ///
    /// Each ready adapter is locked first, then exclusive accelerator access
    /// is taken, so clearing waits for in-flight runs and no run starts until
    /// it is done. An adapter that cannot stay usable is unloaded afterwards.
    /// Returns how many adapters were cleared.
    ///
    /// # Errors
    /// - The accelerator gate was closed
    #[instrument(skip(self), level = "debug")]
    pub async fn clear_accelerator_cache(&self) -> Result<usize> {
        let ready: Vec<Arc<LoadedModel>> = self
            .entries
            .iter()
            .filter_map(|entry| match &*entry.slot.borrow() {
                Slot::Ready(model) => Some(Arc::clone(model)),
                _ => None,
            })
            .collect();
        if ready.is_empty() {
            return Ok(0);
        }

        let mut adapters = Vec::with_capacity(ready.len());
        for model in &ready {
            let adapter = Arc::clone(&model.adapter).lock_owned().await;
            adapters.push((model.id.clone(), adapter));
        }
        let exclusive = self.gate.exclusive().await?;
        let outcome = tokio::task::spawn_blocking(move || {
            adapters
                .into_iter()
                .map(|(id, mut adapter)| {
                    let result = adapter.clear_cache();
                    (id, result)
                })
                .collect::<Vec<_>>()
        })
        .await;
        exclusive.release();
        let outcome = outcome
            .map_err(|e| BgServeError::internal(format!("cache clearing task failed: {e}")))?;

        let mut cleared = 0;
        for (id, result) in outcome {
            match result {
                Ok(()) => cleared += 1,
                Err(e) => {
                    warn!(model = %id, error = %e, "cache clearing broke the adapter, unloading it");
                    if let Err(e) = self.unload(&id).await {
                        warn!(model = %id, error = %e, "failed to unload model after cache clearing");
                    }
                },
            }
        }
        info!(cleared, "accelerator cache cleared");
        Ok(cleared)
    }

    /// Unload every model, logging failures
    pub async fn shutdown(&self) {
        for entry in &self.entries {
            if let Err(e) = self.unload_entry(entry, |_| true).await {
                warn!(model = %entry.id(), error = %e, "failed to unload model during shutdown");
            }
        }
    }
}
