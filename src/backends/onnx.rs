//! ONNX Runtime backend implementation for background removal models
//!
//! Sessions are built from weight files resolved by the weight cache, placed
//! on the device chosen at startup (CUDA, `CoreML` or CPU).

use crate::config::{Device, ExecutionProvider};
use crate::error::{BgServeError, Result};
use crate::inference::{BackendOptions, InferenceBackend};
use ndarray::{Array4, Ix4};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::{Path, PathBuf};

/// ONNX Runtime backend for running background removal models
#[derive(Debug, Default)]
pub struct OnnxBackend {
    session: Option<Session>,
    device: Option<Device>,
    /// Weights and options of the current session, for rebuilding it
    source: Option<(PathBuf, BackendOptions)>,
}

impl OnnxBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device the current session runs on, if loaded
    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.device
    }

    fn cuda_available() -> bool {
        OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false)
    }

    fn coreml_available() -> bool {
        OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false)
    }

    /// List all ONNX Runtime execution providers with availability status and descriptions
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!("🔍 System Hardware Analysis:");
        log::debug!("  - Platform: {os}", os = std::env::consts::OS);
        log::debug!("  - Architecture: {arch}", arch = std::env::consts::ARCH);

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                Self::cuda_available(),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                Self::coreml_available(),
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Resolve a requested provider into the device sessions will use
    ///
    /// Auto-detect prefers CUDA, then `CoreML`, then CPU. Explicit requests
    /// for an unavailable accelerator fall back to CPU.
    #[must_use]
    pub fn detect_device(provider: ExecutionProvider) -> Device {
        match provider {
            ExecutionProvider::Cpu => {
                log::info!("Using CPU execution provider");
                Device::Cpu
            },
            ExecutionProvider::Auto => {
                if Self::cuda_available() {
                    log::info!("🚀 CUDA execution provider is available and will be used");
                    Device::Cuda { device_id: 0 }
                } else if Self::coreml_available() {
                    log::info!("🍎 CoreML execution provider is available and will be used");
                    Device::CoreMl
                } else {
                    log::warn!("⚠️ No hardware acceleration available, falling back to CPU");
                    Device::Cpu
                }
            },
            ExecutionProvider::Cuda => {
                if Self::cuda_available() {
                    log::info!("Using CUDA execution provider");
                    Device::Cuda { device_id: 0 }
                } else {
                    log::warn!(
                        "CUDA execution provider requested but not available, falling back to CPU"
                    );
                    Device::Cpu
                }
            },
            ExecutionProvider::CoreMl => {
                if Self::coreml_available() {
                    log::info!("🍎 Using CoreML execution provider (explicitly requested)");
                    Device::CoreMl
                } else {
                    log::error!("🚫 CoreML execution provider requested but not available!");
                    log::error!("  - Falling back to CPU (will be much slower)");
                    Device::Cpu
                }
            },
        }
    }

    fn build_session(weights: &Path, options: &BackendOptions) -> Result<Session> {
        fn load_error<E: std::fmt::Display>(weights: &Path, stage: &str, e: E) -> BgServeError {
            BgServeError::model_load_failed(weights.display().to_string(), format!("{stage}: {e}"))
        }

        let mut session_builder = Session::builder()
            .map_err(|e| load_error(weights, "Failed to create session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(weights, "Failed to set optimization level", e))?;

        session_builder = match options.device {
            Device::Cpu => session_builder,
            Device::Cuda { device_id } => {
                let cuda_provider =
                    CUDAExecutionProvider::default().with_device_id(device_id as i32);
                log::debug!("CUDA provider configuration: {cuda_provider:?}");
                session_builder
                    .with_execution_providers([cuda_provider.build()])
                    .map_err(|e| load_error(weights, "Failed to set CUDA execution provider", e))?
            },
            Device::CoreMl => {
                // Subgraphs let CoreML take the partitions it supports
                let coreml_provider = CoreMLExecutionProvider::default().with_subgraphs(true);
                log::debug!("CoreML provider config: {coreml_provider:?}");
                session_builder
                    .with_execution_providers([coreml_provider.build()])
                    .map_err(|e| load_error(weights, "Failed to set CoreML execution provider", e))?
            },
        };

        let intra_threads = if options.intra_threads > 0 {
            options.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(8)
        };

        session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| load_error(weights, "Failed to set intra threads", e))?
            .commit_from_file(weights)
            .map_err(|e| load_error(weights, "Failed to create session from model file", e))
    }
}

impl InferenceBackend for OnnxBackend {
    fn load(&mut self, weights: &Path, options: &BackendOptions) -> Result<instant::Duration> {
        let model_load_start = std::time::Instant::now();

        if !weights.is_file() {
            return Err(BgServeError::model_load_failed(
                weights.display().to_string(),
                "weight file does not exist",
            ));
        }

        let session = Self::build_session(weights, options)?;

        log::debug!("✅ ONNX Runtime session created successfully");
        log::debug!("Session configuration:");
        log::debug!("  - Device: {}", options.device);
        log::debug!("  - Precision: {}", options.precision);
        log::debug!("  - Weights: {}", weights.display());

        self.session = Some(session);
        self.device = Some(options.device);
        self.source = Some((weights.to_path_buf(), *options));

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "📊 Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );

        Ok(model_load_time)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgServeError::inference("ONNX session not initialized"))?;

        let inference_start = std::time::Instant::now();
        log::debug!("🚀 Starting inference with input shape: {:?}", input.dim());

        let input_value = Value::from_array(input.clone())
            .map_err(|e| BgServeError::inference(format!("Failed to convert input tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgServeError::inference(format!("ONNX inference failed: {e}")))?;

        // Multi-scale models list the finest prediction last
        let last_key = outputs
            .keys()
            .last()
            .map(ToString::to_string)
            .ok_or_else(|| BgServeError::inference("No output tensors found"))?;
        let output_tensor = outputs
            .get(last_key.as_str())
            .ok_or_else(|| BgServeError::inference("Output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| BgServeError::inference(format!("Failed to extract output tensor: {e}")))?;

        let output_shape = output_tensor.shape().to_vec();
        let result = output_tensor
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|_| {
                BgServeError::inference(format!(
                    "Expected 4D output tensor, got shape {output_shape:?}"
                ))
            })?;

        log::debug!(
            "📊 Inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(result)
    }

    fn clear_cache(&mut self) -> Result<()> {
        let Some((weights, options)) = self.source.clone() else {
            return Ok(());
        };
        if self.session.is_none() {
            return Ok(());
        }

        // The arena allocator only gives memory back when its session is dropped
        self.session = None;
        match Self::build_session(&weights, &options) {
            Ok(session) => {
                self.session = Some(session);
                log::info!("Rebuilt ONNX session on {} to release arena memory", options.device);
                Ok(())
            },
            Err(e) => {
                self.unload();
                Err(e)
            },
        }
    }

    fn unload(&mut self) {
        if self.session.take().is_some() {
            log::info!("Released ONNX session on {}", self.device.unwrap_or_default());
        }
        self.device = None;
        self.source = None;
    }

    fn is_initialized(&self) -> bool {
        self.session.is_some()
    }
}
