#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Background Removal Inference Service
//!
//! A serving layer for background removal models: a registry that lazily
//! loads and unloads heavyweight ONNX models on demand, an admission gate that
//! bounds concurrent work on the accelerator, and a dispatch service that
//! routes "remove this background" requests through one uniform adapter
//! contract.
//!
//! ## Features
//!
//! - **Multiple Models**: RMBG-2.0, BEN2 (with foreground refinement) and `BiRefNet`
//! - **Lazy Lifecycle**: models load on first use, concurrent callers share one load
//! - **Admission Control**: at most `N` inference runs on the accelerator, with
//!   exclusive access for loads and unloads
//! - **Hardware Acceleration**: CUDA, `CoreML` and CPU execution providers
//! - **Weight Caching**: automatic download from `HuggingFace` into a
//!   checksummed on-disk cache
//! - **HTTP Server**: optional axum front end (enable with the `server` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgremove_serve::{InferenceDispatchService, InferenceRequest, ServiceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::builder().gate_capacity(2).build()?;
//! let service = InferenceDispatchService::from_config(config)?;
//!
//! let upload = tokio::fs::read("input.jpg").await?;
//! let output = service
//!     .remove_background(InferenceRequest::new(upload).with_model("rmbg2"))
//!     .await?;
//! tokio::fs::write("output.png", &output.png).await?;
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Adapters
//!
//! The registry only knows the [`ModelAdapter`] contract. Anything that
//! implements it can be served by providing an [`AdapterFactory`] to
//! [`InferenceDispatchService::with_factory`].
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend used by the built-in adapters
//! - `server` (default): HTTP layer, tracing subscriber setup and the `bgremove-server` binary
//! - `webp-support` (default): WebP uploads
//! - `tracing-json`: JSON log output

pub mod adapters;
pub mod backends;
pub mod cache;
#[cfg(feature = "server")]
pub mod cli;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod eviction;
pub mod gate;
pub mod inference;
pub mod models;
pub mod registry;
#[cfg(feature = "server")]
pub mod server;
pub mod service;
pub mod tracing_config;
pub mod utils;

// Public API exports
pub use adapters::{
    AdapterFactory, BackendFactory, Ben2Adapter, BiRefNetAdapter, DefaultAdapterFactory,
    ModelAdapter, OnnxBackendFactory, Rmbg2Adapter, RunOptions,
};
pub use backends::*;
pub use cache::{format_size, CachedModelInfo, ModelCache};
pub use codec::{CanonicalImage, ImageCodec};
pub use config::{
    Device, ExecutionProvider, IdleEvictionConfig, ImageLimits, Precision, ServiceConfig,
    ServiceConfigBuilder,
};
pub use download::{LocalWeights, ModelDownloader, ResolvedWeights, WeightProvider};
pub use error::{BgServeError, FailureReason, Result};
pub use eviction::IdleEvictor;
pub use gate::{AcceleratorGate, ExclusiveAccess, GatePermit};
pub use inference::{BackendOptions, InferenceBackend};
pub use models::{
    builtin_catalog, AdapterMetadata, InputSize, ModelDescriptor, ModelType, VariantKind,
    WeightSource,
};
pub use registry::{ModelLease, ModelRegistry, ModelState, ModelStatus, Placement};
pub use service::{
    HealthReport, InferenceDispatchService, InferenceOutput, InferenceRequest, InferenceTimings,
    ModelSummary, RequestStage,
};
pub use tracing_config::{TracingConfig, TracingFormat};
pub use utils::ImagePreprocessor;
