//! Inference backend abstraction
//!
//! Adapters own their pre/post-processing and delegate the tensor
//! computation to an [`InferenceBackend`]. Backends are synchronous and are
//! driven from blocking threads by the dispatch service.

use crate::config::{Device, Precision};
use crate::error::Result;
use ndarray::Array4;
use std::path::Path;

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Session options used when loading weights into a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    pub device: Device,
    pub precision: Precision,
    /// Intra-op threads (0 = auto)
    pub intra_threads: usize,
}

impl BackendOptions {
    #[must_use]
    pub fn new(device: Device, precision: Precision) -> Self {
        Self {
            device,
            precision,
            intra_threads: 0,
        }
    }

    #[must_use]
    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }
}

/// Trait for tensor inference engines
pub trait InferenceBackend: Send {
    /// Load weights and allocate the session on the configured device
    ///
    /// Returns the time spent building the session.
    ///
    /// # Errors
    /// - Weight file missing or unreadable
    /// - Session creation failures on the requested device
    fn load(&mut self, weights: &Path, options: &BackendOptions) -> Result<Duration>;

    /// Run inference on an NCHW input tensor
    ///
    /// # Errors
    /// - Backend not loaded
    /// - Model inference failures
    /// - Output tensor is not 4-dimensional
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Return cached device memory to the allocator, keeping the model usable
    ///
    /// # Errors
    /// - The session could not be rebuilt; the backend is then unloaded
    fn clear_cache(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop the session and free device memory
    fn unload(&mut self);

    /// Check if a session is loaded
    fn is_initialized(&self) -> bool;
}
