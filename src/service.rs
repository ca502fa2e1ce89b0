//! Inference dispatch service
//!
//! [`InferenceDispatchService`] is the facade the HTTP layer talks to. It owns
//! the [`ModelRegistry`], the [`AcceleratorGate`] inside it and the image
//! codec, and turns every request into either an [`InferenceOutput`] or a
//! [`BgServeError`] carrying a [`FailureReason`](crate::FailureReason).
//!
//! A request moves through these stages:
//!
//! ```text
//! Received -> Validating -> Decoding -> ModelResolving -> Inferring -> Encoding -> Succeeded
//!                 \______________\______________\______________\___________\-> Failed
//! ```
//!
//! Decoding happens before the model is resolved so malformed uploads are
//! rejected as `InvalidImage` without triggering a model load.

use crate::adapters::{AdapterFactory, DefaultAdapterFactory, RunOptions};
use crate::cache::ModelCache;
use crate::codec::{CanonicalImage, ImageCodec};
use crate::config::{Device, Precision, ServiceConfig};
use crate::download::ModelDownloader;
use crate::error::{BgServeError, FailureReason, Result};
use crate::eviction::IdleEvictor;
use crate::gate::AcceleratorGate;
use crate::models::{builtin_catalog, ModelDescriptor};
use crate::registry::{ModelRegistry, ModelState, ModelStatus, Placement};
use instant::Instant;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// One "remove background" call
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    /// Encoded upload (PNG, JPEG, WebP, ...)
    pub image: Vec<u8>,
    /// Model to use; the configured default when `None` or blank
    pub model_id: Option<String>,
    /// Ask for the model's refinement pass, ignored when unsupported
    pub enable_refinement: bool,
}

impl InferenceRequest {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_model<S: Into<String>>(mut self, model_id: S) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_refinement(mut self, enable: bool) -> Self {
        self.enable_refinement = enable;
        self
    }
}

/// Per-stage timing breakdown of a successful request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferenceTimings {
    pub decode_ms: u64,
    /// Time spent waiting for the model to become ready (includes loading)
    pub model_wait_ms: u64,
    /// Adapter lock, gate slot and run
    pub inference_ms: u64,
    pub encode_ms: u64,
    pub total_ms: u64,
}

/// Result of a successful background removal
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// PNG with the foreground mask in the alpha channel
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub model_id: String,
    pub refinement_applied: bool,
    pub timings: InferenceTimings,
}

/// Summary row for the model listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub id: String,
    pub display_name: String,
    pub loaded: bool,
    pub state: ModelState,
    pub supports_refinement: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,
}

impl From<&ModelStatus> for ModelSummary {
    fn from(status: &ModelStatus) -> Self {
        Self {
            id: status.descriptor.id.clone(),
            display_name: status.descriptor.display_name.clone(),
            loaded: status.is_loaded(),
            state: status.state,
            supports_refinement: status.descriptor.supports_refinement,
            device: status.device(),
            precision: status.precision(),
        }
    }
}

/// Liveness report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub device: Device,
    pub models_loaded: usize,
    pub gate_capacity: usize,
    pub gate_in_flight: usize,
    pub uptime_secs: u64,
}

/// Progress of one request through the dispatch pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Validating,
    Decoding,
    ModelResolving,
    Inferring,
    Encoding,
    Succeeded,
    Failed,
}

impl RequestStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::Decoding => "decoding",
            Self::ModelResolving => "model_resolving",
            Self::Inferring => "inferring",
            Self::Encoding => "encoding",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Tracks the current stage and logs each transition
struct StageTracker {
    stage: RequestStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: RequestStage::Received,
        }
    }

    fn enter(&mut self, next: RequestStage) {
        debug!(from = self.stage.as_str(), to = next.as_str(), "request stage");
        self.stage = next;
    }
}

/// Facade over the registry, gate and codec
pub struct InferenceDispatchService {
    config: ServiceConfig,
    registry: Arc<ModelRegistry>,
    codec: ImageCodec,
    evictor: Mutex<Option<IdleEvictor>>,
    started: Instant,
}

impl std::fmt::Debug for InferenceDispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceDispatchService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl InferenceDispatchService {
    /// Build the service with the built-in catalog, ONNX adapters and the
    /// Hugging Face weight downloader
    ///
    /// Must be called from within a Tokio runtime when idle eviction is
    /// enabled.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Cache directory cannot be created
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let cache = ModelCache::with_cache_dir(&config.resolved_cache_dir()?)?;
        info!(cache_dir = %cache.cache_dir().display(), "using weight cache");
        let downloader = ModelDownloader::new(cache)?;
        let factory = DefaultAdapterFactory::new(Arc::new(downloader))
            .with_intra_threads(config.intra_threads);
        Self::with_factory(config, builtin_catalog(), Arc::new(factory))
    }

    /// Build the service with an explicit catalog and adapter factory
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Duplicate model ids in `catalog`
    /// - `default_model` is not in `catalog`
    pub fn with_factory(
        config: ServiceConfig,
        catalog: Vec<ModelDescriptor>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.execution_provider.resolve();
        let placement = Placement {
            device,
            precision: config.precision_for(device),
        };
        let gate = AcceleratorGate::new(config.gate_capacity)?;
        let registry = ModelRegistry::new(catalog, factory, gate, placement)?
            .with_unload_timeout(config.unload_timeout);

        if !registry.contains(&config.default_model) {
            return Err(BgServeError::invalid_config(format!(
                "default model '{}' is not registered",
                config.default_model
            )));
        }

        let registry = Arc::new(registry);
        let evictor = config
            .idle_eviction
            .map(|eviction| IdleEvictor::spawn(Arc::clone(&registry), eviction));

        info!(
            %device,
            precision = %placement.precision,
            gate_capacity = config.gate_capacity,
            default_model = %config.default_model,
            "inference dispatch service ready"
        );

        Ok(Self {
            codec: ImageCodec::new(config.limits),
            config,
            registry,
            evictor: Mutex::new(evictor),
            started: Instant::now(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Remove the background from an uploaded image
    ///
    /// # Errors
    /// - `ModelNotFound` for an unknown model id
    /// - `InvalidImage` for empty, oversized or undecodable uploads
    /// - `ModelLoadFailed` / `ModelLoadTimeout` when the model cannot be made ready
    /// - `InferenceFailed` when the adapter fails
    /// - `InferenceTimeout` when the run exceeds its budget
    #[instrument(skip_all, fields(model = tracing::field::Empty, bytes = request.image.len()))]
    pub async fn remove_background(&self, request: InferenceRequest) -> Result<InferenceOutput> {
        let mut tracker = StageTracker::new();
        let result = self.dispatch(request, &mut tracker).await;
        match &result {
            Ok(output) => {
                tracker.enter(RequestStage::Succeeded);
                info!(
                    model = %output.model_id,
                    width = output.width,
                    height = output.height,
                    refined = output.refinement_applied,
                    total_ms = output.timings.total_ms,
                    "background removed"
                );
            },
            Err(e) => {
                let failed_in = tracker.stage;
                tracker.enter(RequestStage::Failed);
                if matches!(e.reason(), FailureReason::InvalidImage | FailureReason::ModelNotFound) {
                    debug!(stage = failed_in.as_str(), error = %e, "request rejected");
                } else {
                    warn!(stage = failed_in.as_str(), error = %e, "request failed");
                }
            },
        }
        result
    }

    async fn dispatch(
        &self,
        request: InferenceRequest,
        tracker: &mut StageTracker,
    ) -> Result<InferenceOutput> {
        let total = Instant::now();

        tracker.enter(RequestStage::Validating);
        let model_id = request
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.config.default_model)
            .to_string();
        tracing::Span::current().record("model", model_id.as_str());
        self.registry.descriptor(&model_id)?;
        if request.image.is_empty() {
            return Err(BgServeError::invalid_image("image data is empty"));
        }

        tracker.enter(RequestStage::Decoding);
        let started = Instant::now();
        let codec = self.codec;
        let bytes = request.image;
        let image = tokio::task::spawn_blocking(move || codec.decode(&bytes))
            .await
            .map_err(|e| BgServeError::internal(format!("decode task failed: {e}")))??;
        let decode_ms = elapsed_ms(started);
        let (width, height) = (image.width(), image.height());

        tracker.enter(RequestStage::ModelResolving);
        let started = Instant::now();
        let lease = tokio::time::timeout(
            self.config.load_timeout,
            self.registry.get_or_load(&model_id),
        )
        .await
        .map_err(|_| BgServeError::ModelLoadTimeout {
            model: model_id.clone(),
            timeout: self.config.load_timeout,
        })??;
        let model_wait_ms = elapsed_ms(started);
        let refinement_applied =
            request.enable_refinement && lease.metadata().supports_refinement;

        tracker.enter(RequestStage::Inferring);
        let started = Instant::now();
        let options = RunOptions {
            enable_refinement: refinement_applied,
        };
        let adapter = lease.adapter();
        let gate = self.registry.gate().clone();
        let run = async move {
            let adapter = adapter.lock_owned().await;
            let permit = gate.acquire().await?;
            tokio::task::spawn_blocking(move || {
                let mut adapter = adapter;
                let output = adapter.run(&image, &options);
                // Give the slot back as soon as the run ends, even if the
                // caller has already timed out
                drop(adapter);
                permit.release();
                drop(lease);
                output
            })
            .await
            .map_err(|e| BgServeError::inference(format!("inference task failed: {e}")))?
        };
        let output = tokio::time::timeout(self.config.inference_timeout, run)
            .await
            .map_err(|_| BgServeError::InferenceTimeout(self.config.inference_timeout))?
            .map_err(|e| match e {
                BgServeError::InferenceFailed(_) | BgServeError::Internal(_) => e,
                other => BgServeError::inference(other.to_string()),
            })?;
        check_output(&output, width, height)?;
        let inference_ms = elapsed_ms(started);

        tracker.enter(RequestStage::Encoding);
        let started = Instant::now();
        let codec = self.codec;
        let png = tokio::task::spawn_blocking(move || codec.encode_png(&output))
            .await
            .map_err(|e| BgServeError::internal(format!("encode task failed: {e}")))??;
        let encode_ms = elapsed_ms(started);

        Ok(InferenceOutput {
            png,
            width,
            height,
            model_id,
            refinement_applied,
            timings: InferenceTimings {
                decode_ms,
                model_wait_ms,
                inference_ms,
                encode_ms,
                total_ms: elapsed_ms(total),
            },
        })
    }

    /// Every registered model with its current state
    #[must_use]
    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry.list().iter().map(ModelSummary::from).collect()
    }

    /// Load a model ahead of the first request
    ///
    /// # Errors
    /// - `ModelNotFound`, `ModelLoadFailed` or `ModelLoadTimeout`
    #[instrument(skip(self))]
    pub async fn load_model(&self, model_id: &str) -> Result<ModelSummary> {
        let lease = tokio::time::timeout(
            self.config.load_timeout,
            self.registry.get_or_load(model_id),
        )
        .await
        .map_err(|_| BgServeError::ModelLoadTimeout {
            model: model_id.to_string(),
            timeout: self.config.load_timeout,
        })??;
        drop(lease);
        Ok(ModelSummary::from(&self.registry.status_of(model_id)?))
    }

    /// Release a model's accelerator resources
    ///
    /// # Errors
    /// - `ModelNotFound` or `ModelBusy`
    #[instrument(skip(self))]
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.registry.unload(model_id).await
    }

    /// Return cached accelerator memory from every loaded model
    ///
    /// Waits for in-flight inference to finish. Returns how many models were
    /// cleared.
    ///
    /// # Errors
    /// - `Internal` if the accelerator gate is closed
    #[instrument(skip(self))]
    pub async fn clear_accelerator_cache(&self) -> Result<usize> {
        self.registry.clear_accelerator_cache().await
    }

    /// Descriptor, state and live adapter metadata of one model
    ///
    /// # Errors
    /// - `ModelNotFound`
    pub fn model_metadata(&self, model_id: &str) -> Result<ModelStatus> {
        self.registry.status_of(model_id)
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let gate = self.registry.gate();
        HealthReport {
            status: "healthy",
            device: self.registry.placement().device,
            models_loaded: self
                .registry
                .list()
                .iter()
                .filter(|status| status.is_loaded())
                .count(),
            gate_capacity: gate.capacity(),
            gate_in_flight: gate.in_flight(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Stop idle eviction and unload every model
    pub async fn shutdown(&self) {
        info!("shutting down inference dispatch service");
        if let Some(evictor) = self.evictor.lock().await.take() {
            evictor.stop().await;
        }
        self.registry.shutdown().await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn check_output(output: &CanonicalImage, width: u32, height: u32) -> Result<()> {
    if (output.width(), output.height()) != (width, height) {
        return Err(BgServeError::inference(format!(
            "adapter returned {}x{} for a {width}x{height} input",
            output.width(),
            output.height()
        )));
    }
    if !output.has_alpha() {
        return Err(BgServeError::inference("adapter output has no alpha channel"));
    }
    Ok(())
}
