//! Configuration types for the inference dispatch service

use crate::error::{BgServeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon GPU acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl ExecutionProvider {
    /// Resolve this provider into the concrete device models are placed on
    ///
    /// `Auto` queries the ONNX Runtime providers once. Explicit accelerator
    /// requests that are not available fall back to the CPU with a warning.
    #[must_use]
    pub fn resolve(self) -> Device {
        #[cfg(feature = "onnx")]
        {
            crate::backends::onnx::OnnxBackend::detect_device(self)
        }
        #[cfg(not(feature = "onnx"))]
        {
            match self {
                Self::Auto | Self::Cpu => Device::Cpu,
                Self::Cuda => Device::Cuda { device_id: 0 },
                Self::CoreMl => Device::CoreMl,
            }
        }
    }
}

/// Accelerator a model instance is placed on
///
/// Serialized as its display form (`cpu`, `cuda:0`, `coreml`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    /// CPU fallback
    #[default]
    Cpu,
    /// NVIDIA GPU by ordinal
    Cuda { device_id: u32 },
    /// Apple Neural Engine / GPU
    CoreMl,
}

impl Device {
    /// Whether this device is a hardware accelerator
    #[must_use]
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl FromStr for Device {
    type Err = BgServeError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda { device_id: 0 }),
            "coreml" => Ok(Self::CoreMl),
            other => {
                if let Some(ordinal) = other.strip_prefix("cuda:") {
                    let device_id = ordinal.parse::<u32>().map_err(|_| {
                        BgServeError::config_value_error("device", s, "cpu, cuda, cuda:N, coreml")
                    })?;
                    Ok(Self::Cuda { device_id })
                } else {
                    Err(BgServeError::config_value_error(
                        "device",
                        s,
                        "cpu, cuda, cuda:N, coreml",
                    ))
                }
            },
        }
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = BgServeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Numeric precision of loaded weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Precision {
    /// 32-bit floating point weights
    Full,
    /// 16-bit floating point weights
    Half,
}

impl Precision {
    /// Default precision for a device: half on accelerators, full on CPU
    #[must_use]
    pub fn default_for(device: Device) -> Self {
        if device.is_accelerator() {
            Self::Half
        } else {
            Self::Full
        }
    }

    /// Directory-friendly name, also used as the wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "fp32",
            Self::Half => "fp16",
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = BgServeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "fp32" | "f32" => Ok(Self::Full),
            "half" | "fp16" | "f16" => Ok(Self::Half),
            _ => Err(BgServeError::config_value_error(
                "precision",
                s,
                "full, fp32, half, fp16",
            )),
        }
    }
}

impl From<Precision> for String {
    fn from(precision: Precision) -> Self {
        precision.as_str().to_string()
    }
}

impl TryFrom<String> for Precision {
    type Error = BgServeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Idle eviction policy for loaded models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleEvictionConfig {
    /// Models unused for longer than this are unloaded
    pub idle_ttl: Duration,
    /// How often the evictor scans the registry
    pub check_interval: Duration,
}

impl IdleEvictionConfig {
    /// Policy with the given TTL, scanning at a quarter of it (clamped to 1s..60s)
    #[must_use]
    pub fn with_ttl(idle_ttl: Duration) -> Self {
        let check_interval = (idle_ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self {
            idle_ttl,
            check_interval,
        }
    }
}

/// Input size limits enforced while decoding uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLimits {
    /// Maximum encoded upload size in bytes
    pub max_bytes: usize,
    /// Maximum decoded width * height
    pub max_pixels: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 25 * 1024 * 1024,
            max_pixels: 64_000_000,
        }
    }
}

/// Configuration for the registry, gate and dispatch service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,

    /// Precision override; `None` picks per device
    pub precision: Option<Precision>,

    /// Maximum concurrent inference executions on the accelerator
    pub gate_capacity: usize,

    /// Model used when a request does not name one
    pub default_model: String,

    /// Budget for a single adapter run
    pub inference_timeout: Duration,

    /// How long a request waits for its model to become ready
    pub load_timeout: Duration,

    /// How long an unload waits for in-flight inference to drain
    pub unload_timeout: Duration,

    /// Idle eviction policy (disabled when `None`)
    pub idle_eviction: Option<IdleEvictionConfig>,

    /// Weight cache root (`None` = `$BGREMOVE_CACHE_DIR` or the user cache dir)
    pub cache_dir: Option<PathBuf>,

    /// Upload limits
    pub limits: ImageLimits,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::default(),
            precision: None,
            gate_capacity: 2,
            default_model: "rmbg2".to_string(),
            inference_timeout: Duration::from_secs(120),
            load_timeout: Duration::from_secs(600),
            unload_timeout: Duration::from_secs(30),
            idle_eviction: None,
            cache_dir: None,
            limits: ImageLimits::default(),
            intra_threads: 0,
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration builder
    ///
    /// ```rust
    /// use bgremove_serve::{ServiceConfig, ExecutionProvider};
    /// use std::time::Duration;
    ///
    /// let config = ServiceConfig::builder()
    ///     .execution_provider(ExecutionProvider::Cpu)
    ///     .gate_capacity(4)
    ///     .inference_timeout(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.gate_capacity, 4);
    /// ```
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - `gate_capacity` is zero
    /// - any timeout is zero
    /// - `default_model` is empty
    /// - image limits are zero
    /// - idle eviction TTL or interval is zero
    pub fn validate(&self) -> Result<()> {
        if self.gate_capacity == 0 {
            return Err(BgServeError::config_value_error(
                "gate_capacity",
                self.gate_capacity,
                ">= 1",
            ));
        }
        // Semaphore::acquire_many takes a u32
        if u32::try_from(self.gate_capacity).is_err() {
            return Err(BgServeError::config_value_error(
                "gate_capacity",
                self.gate_capacity,
                "<= u32::MAX",
            ));
        }

        for (name, value) in [
            ("inference_timeout", self.inference_timeout),
            ("load_timeout", self.load_timeout),
            ("unload_timeout", self.unload_timeout),
        ] {
            if value.is_zero() {
                return Err(BgServeError::config_value_error(name, "0s", "> 0s"));
            }
        }

        if self.default_model.trim().is_empty() {
            return Err(BgServeError::invalid_config("default_model must not be empty"));
        }

        if self.limits.max_bytes == 0 || self.limits.max_pixels == 0 {
            return Err(BgServeError::invalid_config(
                "image limits must be greater than zero",
            ));
        }

        if let Some(eviction) = &self.idle_eviction {
            if eviction.idle_ttl.is_zero() || eviction.check_interval.is_zero() {
                return Err(BgServeError::invalid_config(
                    "idle eviction TTL and check interval must be greater than zero",
                ));
            }
        }

        Ok(())
    }

    /// Precision to load models with on `device`
    #[must_use]
    pub fn precision_for(&self, device: Device) -> Precision {
        self.precision.unwrap_or_else(|| Precision::default_for(device))
    }

    /// Resolved weight cache root
    ///
    /// # Errors
    /// - No cache directory could be determined for the current user
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::cache::ModelCache::default_cache_dir(),
        }
    }
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set execution provider
    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    /// Force a weight precision instead of the per-device default
    #[must_use]
    pub fn precision(mut self, precision: Precision) -> Self {
        self.config.precision = Some(precision);
        self
    }

    /// Set the accelerator gate capacity
    #[must_use]
    pub fn gate_capacity(mut self, capacity: usize) -> Self {
        self.config.gate_capacity = capacity;
        self
    }

    /// Set the default model id
    #[must_use]
    pub fn default_model<S: Into<String>>(mut self, model: S) -> Self {
        self.config.default_model = model.into();
        self
    }

    /// Set the inference timeout
    #[must_use]
    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.config.inference_timeout = timeout;
        self
    }

    /// Set the model load wait timeout
    #[must_use]
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.config.load_timeout = timeout;
        self
    }

    /// Set the unload drain timeout
    #[must_use]
    pub fn unload_timeout(mut self, timeout: Duration) -> Self {
        self.config.unload_timeout = timeout;
        self
    }

    /// Enable idle eviction
    #[must_use]
    pub fn idle_eviction(mut self, eviction: IdleEvictionConfig) -> Self {
        self.config.idle_eviction = Some(eviction);
        self
    }

    /// Set the weight cache directory
    #[must_use]
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    /// Set the maximum encoded upload size
    #[must_use]
    pub fn max_image_bytes(mut self, bytes: usize) -> Self {
        self.config.limits.max_bytes = bytes;
        self
    }

    /// Set the maximum decoded pixel count
    #[must_use]
    pub fn max_image_pixels(mut self, pixels: u64) -> Self {
        self.config.limits.max_pixels = pixels;
        self
    }

    /// Set number of intra-op threads
    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// Returns the first validation failure from [`ServiceConfig::validate`].
    pub fn build(self) -> Result<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gate_capacity, 2);
        assert_eq!(config.default_model, "rmbg2");
        assert_eq!(config.inference_timeout, Duration::from_secs(120));
        assert!(config.idle_eviction.is_none());
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let result = ServiceConfig::builder().gate_capacity(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_timeouts() {
        assert!(ServiceConfig::builder()
            .inference_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ServiceConfig::builder()
            .unload_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_sets_values() {
        let config = ServiceConfig::builder()
            .execution_provider(ExecutionProvider::Cpu)
            .precision(Precision::Full)
            .gate_capacity(3)
            .default_model("birefnet")
            .idle_eviction(IdleEvictionConfig::with_ttl(Duration::from_secs(300)))
            .cache_dir("/tmp/bgremove-cache")
            .max_image_bytes(1024)
            .build()
            .unwrap();

        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.precision, Some(Precision::Full));
        assert_eq!(config.gate_capacity, 3);
        assert_eq!(config.default_model, "birefnet");
        assert_eq!(config.limits.max_bytes, 1024);
        assert_eq!(
            config.resolved_cache_dir().unwrap(),
            PathBuf::from("/tmp/bgremove-cache")
        );
        let eviction = config.idle_eviction.unwrap();
        assert_eq!(eviction.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(
            "CUDA:1".parse::<Device>().unwrap(),
            Device::Cuda { device_id: 1 }
        );
        assert_eq!(
            "cuda".parse::<Device>().unwrap(),
            Device::Cuda { device_id: 0 }
        );
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda { device_id: 2 }.to_string(), "cuda:2");
    }

    #[test]
    fn test_device_and_precision_serialize_as_display_strings() {
        assert_eq!(serde_json::to_value(Device::Cpu).unwrap(), "cpu");
        assert_eq!(
            serde_json::to_value(Device::Cuda { device_id: 1 }).unwrap(),
            "cuda:1"
        );
        assert_eq!(serde_json::to_value(Precision::Half).unwrap(), "fp16");

        let device: Device = serde_json::from_str("\"cuda:2\"").unwrap();
        assert_eq!(device, Device::Cuda { device_id: 2 });
        let precision: Precision = serde_json::from_str("\"fp32\"").unwrap();
        assert_eq!(precision, Precision::Full);
        assert!(serde_json::from_str::<Device>("\"tpu\"").is_err());
    }

    #[test]
    fn test_precision_defaults_per_device() {
        assert_eq!(Precision::default_for(Device::Cpu), Precision::Full);
        assert_eq!(
            Precision::default_for(Device::Cuda { device_id: 0 }),
            Precision::Half
        );

        let config = ServiceConfig::default();
        assert_eq!(config.precision_for(Device::Cpu), Precision::Full);

        let forced = ServiceConfig::builder()
            .precision(Precision::Full)
            .build()
            .unwrap();
        assert_eq!(
            forced.precision_for(Device::Cuda { device_id: 0 }),
            Precision::Full
        );
    }

    #[test]
    fn test_precision_parsing() {
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::Half);
        assert_eq!("Full".parse::<Precision>().unwrap(), Precision::Full);
        assert!("int8".parse::<Precision>().is_err());
    }

    #[test]
    fn test_cpu_provider_resolves_to_cpu() {
        assert_eq!(ExecutionProvider::Cpu.resolve(), Device::Cpu);
    }
}
