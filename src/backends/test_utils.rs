//! Test utilities and mock backends for testing inference functionality
//!
//! [`MockBackend`] implements `InferenceBackend` without model files so the
//! concrete adapters' pre/post-processing can be exercised end to end.

use crate::{
    error::{BgServeError, Result},
    inference::{BackendOptions, InferenceBackend},
};
use instant::Duration;
use ndarray::Array4;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Mock backend producing a soft circular foreground mask
#[derive(Debug, Clone)]
pub struct MockBackend {
    initialized: bool,
    /// Emit logits instead of probabilities
    logits: bool,
    /// Call history for verification in tests
    call_history: Arc<Mutex<Vec<String>>>,
    /// Options and weight path seen by the last `load`
    last_load: Arc<Mutex<Option<(PathBuf, BackendOptions)>>>,
    should_fail_load: bool,
    should_fail_inference: bool,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            logits: false,
            call_history: Arc::new(Mutex::new(Vec::new())),
            last_load: Arc::new(Mutex::new(None)),
            should_fail_load: false,
            should_fail_inference: false,
        }
    }

    /// Mock backend whose output needs a sigmoid
    #[must_use]
    pub fn with_logits() -> Self {
        let mut backend = Self::new();
        backend.logits = true;
        backend
    }

    /// Create a mock backend that will fail while loading
    #[must_use]
    pub fn new_failing_load() -> Self {
        let mut backend = Self::new();
        backend.should_fail_load = true;
        backend
    }

    /// Create a mock backend that will fail during inference
    #[must_use]
    pub fn new_failing_inference() -> Self {
        let mut backend = Self::new();
        backend.should_fail_inference = true;
        backend
    }

    /// Get the call history for verification in tests
    pub fn get_call_history(&self) -> Vec<String> {
        self.call_history.lock().unwrap().clone()
    }

    /// Weight path and options passed to the last `load`
    pub fn last_load(&self) -> Option<(PathBuf, BackendOptions)> {
        self.last_load.lock().unwrap().clone()
    }

    fn record_call(&self, method: &str) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(method.to_string());
        }
    }

    /// Circular mask matching the input's spatial dimensions
    fn generate_mock_output(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, _, height, width) = input.dim();
        let mut output = Array4::<f32>::zeros((batch_size, 1, height, width));

        let center_x = width as f32 / 2.0;
        let center_y = height as f32 / 2.0;
        let radius = (width.min(height) as f32 / 3.0).max(1.0);

        for ((_, _, y, x), value) in output.indexed_iter_mut() {
            let dx = x as f32 - center_x;
            let dy = y as f32 - center_y;
            let distance = (dx * dx + dy * dy).sqrt();
            let probability = if distance < radius { 1.0 } else { 0.0 };
            *value = if self.logits {
                probability * 16.0 - 8.0
            } else {
                probability
            };
        }

        output
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn load(&mut self, weights: &Path, options: &BackendOptions) -> Result<Duration> {
        self.record_call("load");

        if self.should_fail_load {
            return Err(BgServeError::model_load_failed(
                weights.display().to_string(),
                "Mock backend load failed",
            ));
        }

        if let Ok(mut last) = self.last_load.lock() {
            *last = Some((weights.to_path_buf(), *options));
        }
        self.initialized = true;
        Ok(Duration::from_millis(5))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.record_call("infer");

        if !self.initialized {
            return Err(BgServeError::inference("Mock backend not initialized"));
        }

        if self.should_fail_inference {
            return Err(BgServeError::inference("Mock backend inference failed"));
        }

        Ok(self.generate_mock_output(input))
    }

    fn clear_cache(&mut self) -> Result<()> {
        self.record_call("clear_cache");
        Ok(())
    }

    fn unload(&mut self) {
        self.record_call("unload");
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Device, Precision};

    #[test]
    fn test_mock_backend_records_calls() {
        let mut backend = MockBackend::new();
        let options = BackendOptions::new(Device::Cpu, Precision::Full);
        backend.load(Path::new("weights.onnx"), &options).unwrap();
        let _ = backend.infer(&Array4::zeros((1, 3, 8, 8))).unwrap();
        backend.unload();

        assert_eq!(backend.get_call_history(), vec!["load", "infer", "unload"]);
        let (path, seen) = backend.last_load().unwrap();
        assert_eq!(path, PathBuf::from("weights.onnx"));
        assert_eq!(seen, options);
    }

    #[test]
    fn test_mock_mask_is_circular() {
        let mut backend = MockBackend::new();
        backend
            .load(
                Path::new("weights.onnx"),
                &BackendOptions::new(Device::Cpu, Precision::Full),
            )
            .unwrap();
        let output = backend.infer(&Array4::zeros((1, 3, 30, 30))).unwrap();
        assert_eq!(output[[0, 0, 15, 15]], 1.0);
        assert_eq!(output[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_failure_modes() {
        let options = BackendOptions::new(Device::Cpu, Precision::Full);
        assert!(MockBackend::new_failing_load()
            .load(Path::new("w.onnx"), &options)
            .is_err());

        let mut failing = MockBackend::new_failing_inference();
        failing.load(Path::new("w.onnx"), &options).unwrap();
        assert!(failing.infer(&Array4::zeros((1, 3, 4, 4))).is_err());
    }
}
