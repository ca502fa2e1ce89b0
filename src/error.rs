//! Error types for the background removal service
//!
//! Every failure that can reach a caller maps to a machine-readable
//! [`FailureReason`] plus a client-safe message. Internal detail (adapter
//! errors, stack context) is kept in the error value for logging but never
//! surfaced through [`BgServeError::public_message`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, BgServeError>;

/// Machine-readable failure codes returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Unknown model identifier (client error)
    ModelNotFound,
    /// The model raised while loading; retryable by the caller
    ModelLoadFailed,
    /// Waiting for a model load exceeded the caller's budget
    ModelLoadTimeout,
    /// Unload requested while inference was still in flight
    ModelBusy,
    /// Undecodable bytes or unsupported color mode (client error)
    InvalidImage,
    /// The adapter raised during inference
    InferenceFailed,
    /// Inference exceeded its time budget
    InferenceTimeout,
    /// Malformed request or configuration
    InvalidRequest,
    /// Unexpected internal condition
    Internal,
}

impl FailureReason {
    /// Stable string form of the reason code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::ModelLoadFailed => "MODEL_LOAD_FAILED",
            Self::ModelLoadTimeout => "MODEL_LOAD_TIMEOUT",
            Self::ModelBusy => "MODEL_BUSY",
            Self::InvalidImage => "INVALID_IMAGE",
            Self::InferenceFailed => "INFERENCE_FAILED",
            Self::InferenceTimeout => "INFERENCE_TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may reasonably retry the same request later
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ModelLoadFailed
                | Self::ModelLoadTimeout
                | Self::ModelBusy
                | Self::InferenceTimeout
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type for registry, gate, adapter and dispatch operations
#[derive(Error, Debug)]
pub enum BgServeError {
    /// Unknown model identifier
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Model loading or preparation failed
    #[error("Failed to load model '{model}': {message}")]
    ModelLoadFailed { model: String, message: String },

    /// Caller stopped waiting for a model load
    #[error("Timed out after {timeout:?} waiting for model '{model}' to load")]
    ModelLoadTimeout { model: String, timeout: Duration },

    /// Model has in-flight inference and cannot be unloaded
    #[error("Model '{model}' is busy: {in_flight} inference call(s) still in flight")]
    ModelBusy { model: String, in_flight: usize },

    /// Image decoding failed or the color mode is unsupported
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Adapter failed while running inference
    #[error("Inference error: {0}")]
    InferenceFailed(String),

    /// Inference exceeded its time budget
    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input/output errors (weight cache, file access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network errors while fetching model weights
    #[error("Network error: {0}")]
    Network(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgServeError {
    /// Create a new model-not-found error
    pub fn model_not_found<S: Into<String>>(model: S) -> Self {
        Self::ModelNotFound(model.into())
    }

    /// Create a new model load error
    pub fn model_load_failed<S: Into<String>, M: Into<String>>(model: S, message: M) -> Self {
        Self::ModelLoadFailed {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid image error
    pub fn invalid_image<S: Into<String>>(msg: S) -> Self {
        Self::InvalidImage(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::InferenceFailed(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a network error with the failing operation as context
    pub fn network_error<S: Into<String>, E: std::fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {})",
            parameter, value, valid_range
        ))
    }

    /// Machine-readable reason code for this error
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::ModelNotFound(_) => FailureReason::ModelNotFound,
            // Weight fetch problems happen during load and stay retryable
            Self::ModelLoadFailed { .. } | Self::Network(_) => FailureReason::ModelLoadFailed,
            Self::ModelLoadTimeout { .. } => FailureReason::ModelLoadTimeout,
            Self::ModelBusy { .. } => FailureReason::ModelBusy,
            Self::InvalidImage(_) => FailureReason::InvalidImage,
            Self::InferenceFailed(_) => FailureReason::InferenceFailed,
            Self::InferenceTimeout(_) => FailureReason::InferenceTimeout,
            Self::InvalidConfig(_) => FailureReason::InvalidRequest,
            Self::Io(_) | Self::Internal(_) => FailureReason::Internal,
        }
    }

    /// Human-readable message that is safe to return to a client
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InferenceFailed(_) => {
                "Background removal failed while running the model".to_string()
            },
            Self::Io(_) | Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<image::ImageError> for BgServeError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::IoError(e) => Self::Io(e),
            other => Self::InvalidImage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BgServeError::model_not_found("nonexistent");
        assert!(matches!(err, BgServeError::ModelNotFound(_)));
        assert_eq!(err.reason(), FailureReason::ModelNotFound);

        let err = BgServeError::model_load_failed("rmbg2", "weights missing");
        assert_eq!(err.reason(), FailureReason::ModelLoadFailed);
        assert!(err.to_string().contains("rmbg2"));
        assert!(err.to_string().contains("weights missing"));
    }

    #[test]
    fn test_inference_failure_hides_detail() {
        let err = BgServeError::inference("CUDA error: out of memory at kernel 0x7f");
        assert_eq!(err.reason(), FailureReason::InferenceFailed);
        assert!(!err.public_message().contains("CUDA"));
        assert!(err.to_string().contains("CUDA"));
    }

    #[test]
    fn test_network_errors_are_load_failures() {
        let err = BgServeError::network_error("Failed to download model.onnx", "connection reset");
        assert_eq!(err.reason(), FailureReason::ModelLoadFailed);
        assert!(err.reason().is_retryable());
    }

    #[test]
    fn test_reason_codes_serialize() {
        let json = serde_json::to_string(&FailureReason::InferenceTimeout).unwrap();
        assert_eq!(json, "\"INFERENCE_TIMEOUT\"");
        assert_eq!(FailureReason::ModelBusy.to_string(), "MODEL_BUSY");
        assert!(!FailureReason::InvalidImage.is_retryable());
    }

    #[test]
    fn test_config_value_error() {
        let err = BgServeError::config_value_error("gate_capacity", 0, ">= 1");
        let message = err.to_string();
        assert!(message.contains("gate_capacity"));
        assert!(message.contains(">= 1"));
        assert_eq!(err.reason(), FailureReason::InvalidRequest);
    }

    #[test]
    fn test_image_error_maps_to_invalid_image() {
        let decode_err = image::load_from_memory(b"definitely not an image").unwrap_err();
        let err: BgServeError = decode_err.into();
        assert_eq!(err.reason(), FailureReason::InvalidImage);
    }
}
