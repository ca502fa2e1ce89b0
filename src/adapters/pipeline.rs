//! Staging, session management and mask prediction shared by the ONNX adapters

use crate::codec::CanonicalImage;
use crate::config::{Device, Precision};
use crate::download::{ResolvedWeights, WeightProvider};
use crate::error::{BgServeError, Result};
use crate::inference::{BackendOptions, InferenceBackend};
use crate::models::{AdapterMetadata, ModelDescriptor, PreprocessingConfig};
use crate::utils::ImagePreprocessor;
use image::{GrayImage, RgbImage};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct OnnxPipeline {
    descriptor: ModelDescriptor,
    preprocessing: PreprocessingConfig,
    /// `None` only while a blocking load has the backend
    backend: Option<Box<dyn InferenceBackend>>,
    weights: Arc<dyn WeightProvider>,
    staged: Option<ResolvedWeights>,
    placement: Option<(Device, Precision)>,
    intra_threads: usize,
}

impl OnnxPipeline {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        backend: Box<dyn InferenceBackend>,
        weights: Arc<dyn WeightProvider>,
        intra_threads: usize,
    ) -> Self {
        let preprocessing = descriptor.variant.preprocessing();
        Self {
            descriptor,
            preprocessing,
            backend: Some(backend),
            weights,
            staged: None,
            placement: None,
            intra_threads,
        }
    }

    pub(crate) fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Fetch weights for the precision the variant can actually run
    pub(crate) async fn stage(&mut self, precision: Precision) -> Result<()> {
        let wanted = self.descriptor.variant.effective_precision(precision);
        if let Some(staged) = &self.staged {
            if staged.precision == wanted {
                return Ok(());
            }
        }

        debug!(model = %self.descriptor.id, %wanted, "staging weights");
        let resolved = self.weights.fetch(&self.descriptor, wanted).await?;
        if resolved.precision != wanted {
            info!(
                model = %self.descriptor.id,
                requested = %wanted,
                using = %resolved.precision,
                "half precision weights unavailable, using full precision"
            );
        }
        self.staged = Some(resolved);
        Ok(())
    }

    /// Load the staged weights into the backend on `device`
    pub(crate) async fn prepare(&mut self, device: Device, precision: Precision) -> Result<()> {
        self.stage(precision).await?;
        let weights = self.staged.clone().ok_or_else(|| {
            BgServeError::model_load_failed(&self.descriptor.id, "weights were not staged")
        })?;

        let mut backend = self.backend.take().ok_or_else(|| {
            BgServeError::model_load_failed(&self.descriptor.id, "backend is unavailable")
        })?;
        let options =
            BackendOptions::new(device, weights.precision).with_intra_threads(self.intra_threads);

        // Session creation is CPU heavy and blocking
        let path = weights.path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = backend.load(&path, &options);
            (backend, result)
        })
        .await;

        let (backend, result) = joined.map_err(|e| {
            BgServeError::model_load_failed(
                &self.descriptor.id,
                format!("session creation task failed: {e}"),
            )
        })?;
        self.backend = Some(backend);

        let elapsed = result.map_err(|e| match e {
            BgServeError::ModelLoadFailed { message, .. } => {
                BgServeError::model_load_failed(&self.descriptor.id, message)
            },
            other => BgServeError::model_load_failed(&self.descriptor.id, other.to_string()),
        })?;

        info!(
            model = %self.descriptor.id,
            %device,
            precision = %weights.precision,
            load_ms = elapsed.as_millis() as u64,
            "model prepared"
        );
        self.placement = Some((device, weights.precision));
        Ok(())
    }

    /// Run the model and return the flattened input plus a full-size mask
    pub(crate) fn predict(&mut self, image: &CanonicalImage) -> Result<(RgbImage, GrayImage)> {
        let backend = self
            .backend
            .as_mut()
            .filter(|backend| backend.is_initialized())
            .ok_or_else(|| {
                BgServeError::inference(format!(
                    "adapter for '{}' is not prepared",
                    self.descriptor.id
                ))
            })?;

        let rgb = ImagePreprocessor::flatten_on_white(image);
        let tensor = ImagePreprocessor::to_tensor(&rgb, &self.preprocessing)?;
        let output = backend.infer(&tensor)?;
        let mask = ImagePreprocessor::mask_from_tensor(
            &output,
            self.preprocessing.output_activation,
            image.width(),
            image.height(),
        )?;
        Ok((rgb, mask))
    }

    /// Merge colours and mask into the canonical output
    pub(crate) fn compose(rgb: &RgbImage, mask: &GrayImage) -> Result<CanonicalImage> {
        Ok(CanonicalImage::from_rgba(ImagePreprocessor::apply_alpha(
            rgb, mask,
        )?))
    }

    /// Drop cached device memory without unloading the model
    pub(crate) fn clear_cache(&mut self) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let result = backend.clear_cache();
        if result.is_err() {
            // A failed rebuild leaves the backend unloaded
            self.placement = None;
        }
        result
    }

    pub(crate) fn release(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.unload();
        }
        if self.placement.take().is_some() {
            info!(model = %self.descriptor.id, "model released");
        }
    }

    pub(crate) fn metadata(&self) -> AdapterMetadata {
        let (device, precision) = self.placement.unwrap_or((
            Device::Cpu,
            self.staged
                .as_ref()
                .map_or(Precision::Full, |staged| staged.precision),
        ));
        AdapterMetadata {
            variant: self.descriptor.variant,
            display_name: self.descriptor.display_name.clone(),
            model_type: self.descriptor.variant.model_type(),
            supports_refinement: self.descriptor.supports_refinement,
            device,
            precision,
            input_size: self.preprocessing.input_size,
        }
    }
}
