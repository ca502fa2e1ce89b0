//! Model adapters: one uniform contract over every background removal variant
//!
//! The registry and dispatch service only ever talk to [`ModelAdapter`].
//! [`AdapterFactory`] is the single place that maps a [`VariantKind`] to a
//! concrete adapter type.
//!
//! Lifecycle of an adapter owned by the registry:
//!
//! 1. [`ModelAdapter::stage`] resolves weights (download, cache lookup) without
//!    touching the accelerator.
//! 2. [`ModelAdapter::prepare`] allocates the model on the device. The registry
//!    calls it while holding exclusive accelerator access.
//! 3. [`ModelAdapter::run`] is pure computation, called with one gate slot held.
//! 4. [`ModelAdapter::release`] frees device resources, again under exclusive access.

mod ben2;
mod birefnet;
mod pipeline;
mod rmbg2;

pub use ben2::Ben2Adapter;
pub use birefnet::BiRefNetAdapter;
pub use rmbg2::Rmbg2Adapter;

use crate::codec::CanonicalImage;
use crate::config::{Device, Precision};
use crate::download::WeightProvider;
use crate::error::{BgServeError, Result};
use crate::inference::InferenceBackend;
use crate::models::{AdapterMetadata, ModelDescriptor, VariantKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-call options for [`ModelAdapter::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Apply the variant's refinement pass; ignored when unsupported
    pub enable_refinement: bool,
}

/// Uniform capability wrapping one concrete background removal model
#[async_trait]
pub trait ModelAdapter: Send {
    /// Resolve resources that do not need the accelerator
    ///
    /// # Errors
    /// - Weight download or cache failures
    async fn stage(&mut self, _device: Device, _precision: Precision) -> Result<()> {
        Ok(())
    }

    /// Allocate model weights on `device`
    ///
    /// # Errors
    /// - Weights unavailable
    /// - Session creation failures
    async fn prepare(&mut self, device: Device, precision: Precision) -> Result<()>;

    /// Remove the background from a canonical image
    ///
    /// Returns an image of the same dimensions with the foreground mask in
    /// its alpha channel.
    ///
    /// # Errors
    /// - Adapter not prepared
    /// - Inference failures
    fn run(&mut self, image: &CanonicalImage, options: &RunOptions) -> Result<CanonicalImage>;

    /// Give cached accelerator memory back while staying prepared
    ///
    /// Called with exclusive accelerator access and no run in flight.
    ///
    /// # Errors
    /// - The adapter could not be kept usable; the registry then unloads it
    fn clear_cache(&mut self) -> Result<()> {
        Ok(())
    }

    /// Free device resources
    fn release(&mut self);

    /// Static capabilities plus current placement
    fn metadata(&self) -> AdapterMetadata;
}

/// Creates inference backends for adapters
pub trait BackendFactory: Send + Sync + std::fmt::Debug {
    /// Create a fresh, unloaded backend for `descriptor`
    ///
    /// # Errors
    /// - Backend not compiled into this build
    fn create_backend(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceBackend>>;
}

/// ONNX Runtime backends for every variant
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxBackendFactory;

impl BackendFactory for OnnxBackendFactory {
    fn create_backend(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceBackend>> {
        #[cfg(feature = "onnx")]
        {
            let _ = descriptor;
            Ok(Box::new(crate::backends::OnnxBackend::new()))
        }
        #[cfg(not(feature = "onnx"))]
        {
            Err(BgServeError::model_load_failed(
                &descriptor.id,
                "ONNX backend not enabled. Compile with the 'onnx' feature",
            ))
        }
    }
}

/// Creates adapters for registered descriptors
pub trait AdapterFactory: Send + Sync {
    /// Instantiate an unprepared adapter for `descriptor`
    ///
    /// # Errors
    /// - No adapter available for the descriptor
    fn create(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelAdapter>>;
}

/// Maps each [`VariantKind`] to its ONNX-backed adapter
#[derive(Debug, Clone)]
pub struct DefaultAdapterFactory {
    weights: Arc<dyn WeightProvider>,
    backends: Arc<dyn BackendFactory>,
    intra_threads: usize,
}

impl DefaultAdapterFactory {
    /// Factory using ONNX Runtime backends
    #[must_use]
    pub fn new(weights: Arc<dyn WeightProvider>) -> Self {
        Self::with_backend_factory(weights, Arc::new(OnnxBackendFactory))
    }

    /// Factory with injected backends
    #[must_use]
    pub fn with_backend_factory(
        weights: Arc<dyn WeightProvider>,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            weights,
            backends,
            intra_threads: 0,
        }
    }

    /// Intra-op threads passed to every backend session
    #[must_use]
    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelAdapter>> {
        let backend = self.backends.create_backend(descriptor)?;
        let pipeline = pipeline::OnnxPipeline::new(
            descriptor.clone(),
            backend,
            Arc::clone(&self.weights),
            self.intra_threads,
        );

        let adapter: Box<dyn ModelAdapter> = match descriptor.variant {
            VariantKind::Rmbg2 => Box::new(Rmbg2Adapter::from_pipeline(pipeline)),
            VariantKind::Ben2 => Box::new(Ben2Adapter::from_pipeline(pipeline)),
            VariantKind::BiRefNet => Box::new(BiRefNetAdapter::from_pipeline(pipeline)),
        };
        Ok(adapter)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backends::test_utils::MockBackend;
    use crate::download::LocalWeights;
    use image::{DynamicImage, Rgba, RgbaImage};

    /// Mock backends; logits when the variant applies a sigmoid
    #[derive(Debug, Default)]
    pub(crate) struct MockBackendFactory;

    impl BackendFactory for MockBackendFactory {
        fn create_backend(
            &self,
            descriptor: &ModelDescriptor,
        ) -> Result<Box<dyn InferenceBackend>> {
            let backend = match descriptor.variant.preprocessing().output_activation {
                crate::models::OutputActivation::Sigmoid => MockBackend::with_logits(),
                crate::models::OutputActivation::Identity => MockBackend::new(),
            };
            Ok(Box::new(backend))
        }
    }

    pub(crate) fn mock_factory() -> DefaultAdapterFactory {
        let weights = LocalWeights::new()
            .with_file("rmbg2", "/mock/rmbg2.onnx")
            .with_file("ben2", "/mock/ben2.onnx")
            .with_file("birefnet", "/mock/birefnet.onnx");
        DefaultAdapterFactory::with_backend_factory(Arc::new(weights), Arc::new(MockBackendFactory))
    }

    pub(crate) fn descriptor(id: &str) -> ModelDescriptor {
        crate::models::builtin_catalog()
            .into_iter()
            .find(|d| d.id == id)
            .unwrap()
    }

    pub(crate) fn test_image(width: u32, height: u32) -> CanonicalImage {
        let image = RgbaImage::from_pixel(width, height, Rgba([30, 120, 200, 255]));
        CanonicalImage::from_dynamic(DynamicImage::ImageRgba8(image)).unwrap()
    }
}
