//! Model catalog: descriptors, variant kinds and static preprocessing metadata
//!
//! Descriptors are declared once at startup and never removed. Capability
//! flags such as refinement support are static fields, never detected at
//! runtime.

use crate::config::{Device, Precision};
use serde::{Deserialize, Serialize};

/// Closed set of adapter implementations the service knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    /// BRIA RMBG 2.0 (`BiRefNet` architecture, 1024x1024 input)
    Rmbg2,
    /// BEN2 matting model with optional foreground refinement
    Ben2,
    /// `BiRefNet` at dynamic resolution
    #[serde(rename = "birefnet")]
    BiRefNet,
}

impl VariantKind {
    /// Kind of prediction the variant produces
    #[must_use]
    pub fn model_type(self) -> ModelType {
        match self {
            Self::Ben2 => ModelType::Matting,
            Self::Rmbg2 | Self::BiRefNet => ModelType::Segmentation,
        }
    }

    /// Whether the variant tolerates half-precision weights
    #[must_use]
    pub fn supports_half_precision(self) -> bool {
        !matches!(self, Self::Ben2)
    }

    /// Precision to actually load with, given the requested one
    #[must_use]
    pub fn effective_precision(self, requested: Precision) -> Precision {
        if self.supports_half_precision() {
            requested
        } else {
            Precision::Full
        }
    }

    /// Input tensor preparation for this variant
    #[must_use]
    pub fn preprocessing(self) -> PreprocessingConfig {
        match self {
            Self::Rmbg2 => PreprocessingConfig {
                input_size: InputSize::Fixed {
                    width: 1024,
                    height: 1024,
                },
                normalization: Normalization::IMAGENET,
                output_activation: OutputActivation::Sigmoid,
            },
            Self::Ben2 => PreprocessingConfig {
                input_size: InputSize::Fixed {
                    width: 1024,
                    height: 1024,
                },
                normalization: Normalization::UNIT,
                output_activation: OutputActivation::Identity,
            },
            Self::BiRefNet => PreprocessingConfig {
                input_size: InputSize::MultipleOf(32),
                normalization: Normalization::IMAGENET,
                output_activation: OutputActivation::Sigmoid,
            },
        }
    }
}

impl std::fmt::Display for VariantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rmbg2 => write!(f, "rmbg2"),
            Self::Ben2 => write!(f, "ben2"),
            Self::BiRefNet => write!(f, "birefnet"),
        }
    }
}

/// Prediction semantics of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Binary-ish foreground mask
    Segmentation,
    /// Soft alpha matte
    Matting,
}

/// How the model input resolution is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum InputSize {
    /// Always resize to this resolution
    Fixed { width: u32, height: u32 },
    /// Keep the image resolution, rounded up to a multiple of this value
    MultipleOf(u32),
}

impl InputSize {
    /// Tensor resolution for an image of `width` x `height`
    #[must_use]
    pub fn resolve(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::Fixed { width, height } => (width, height),
            Self::MultipleOf(step) => {
                let step = step.max(1);
                (
                    width.max(1).div_ceil(step) * step,
                    height.max(1).div_ceil(step) * step,
                )
            },
        }
    }
}

/// Per-channel mean/std normalization applied to [0, 1] pixel values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// `ImageNet` statistics
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Plain [0, 1] scaling
    pub const UNIT: Self = Self {
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };
}

/// Activation applied to the raw model output before it becomes alpha
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Output is logits
    Sigmoid,
    /// Output is already a probability
    Identity,
}

/// Static input preparation for a variant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    pub input_size: InputSize,
    pub normalization: Normalization,
    pub output_activation: OutputActivation,
}

/// Where a model's weights live on the Hugging Face hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSource {
    /// Repository, e.g. `briaai/RMBG-2.0`
    pub repo: String,
    /// Path of the fp32 ONNX file inside the repository
    pub full_precision_file: String,
    /// Path of the fp16 ONNX file, if the repository publishes one
    pub half_precision_file: Option<String>,
}

impl WeightSource {
    /// File to fetch for `precision`, falling back to fp32
    #[must_use]
    pub fn file_for(&self, precision: Precision) -> (&str, Precision) {
        match (precision, &self.half_precision_file) {
            (Precision::Half, Some(file)) => (file.as_str(), Precision::Half),
            _ => (self.full_precision_file.as_str(), Precision::Full),
        }
    }
}

/// Identity and static capabilities of a registered model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub supports_refinement: bool,
    pub variant: VariantKind,
    #[serde(skip)]
    pub weights: Option<WeightSource>,
}

impl ModelDescriptor {
    /// Descriptor without a downloadable weight source
    pub fn new<S: Into<String>, D: Into<String>>(
        id: S,
        display_name: D,
        variant: VariantKind,
        supports_refinement: bool,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            supports_refinement,
            variant,
            weights: None,
        }
    }

    /// Attach a Hugging Face weight source
    #[must_use]
    pub fn with_weights(mut self, weights: WeightSource) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Built-in descriptors registered at startup
#[must_use]
pub fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("rmbg2", "RMBG 2.0", VariantKind::Rmbg2, false).with_weights(
            WeightSource {
                repo: "briaai/RMBG-2.0".to_string(),
                full_precision_file: "onnx/model.onnx".to_string(),
                half_precision_file: Some("onnx/model_fp16.onnx".to_string()),
            },
        ),
        ModelDescriptor::new("ben2", "BEN2", VariantKind::Ben2, true).with_weights(WeightSource {
            repo: "PramaLLC/BEN2".to_string(),
            full_precision_file: "BEN2_Base.onnx".to_string(),
            half_precision_file: None,
        }),
        ModelDescriptor::new("birefnet", "BiRefNet", VariantKind::BiRefNet, false).with_weights(
            WeightSource {
                repo: "onnx-community/BiRefNet-ONNX".to_string(),
                full_precision_file: "onnx/model.onnx".to_string(),
                half_precision_file: Some("onnx/model_fp16.onnx".to_string()),
            },
        ),
    ]
}

/// Runtime description of a prepared adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterMetadata {
    pub variant: VariantKind,
    pub display_name: String,
    pub model_type: ModelType,
    pub supports_refinement: bool,
    pub device: Device,
    pub precision: Precision,
    pub input_size: InputSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_ids_are_unique() {
        let catalog = builtin_catalog();
        let mut ids: Vec<_> = catalog.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, vec!["ben2", "birefnet", "rmbg2"]);
    }

    #[test]
    fn test_only_ben2_supports_refinement() {
        for descriptor in builtin_catalog() {
            assert_eq!(
                descriptor.supports_refinement,
                descriptor.variant == VariantKind::Ben2,
                "{}",
                descriptor.id
            );
        }
    }

    #[test]
    fn test_ben2_forces_full_precision() {
        assert_eq!(
            VariantKind::Ben2.effective_precision(Precision::Half),
            Precision::Full
        );
        assert_eq!(
            VariantKind::Rmbg2.effective_precision(Precision::Half),
            Precision::Half
        );
    }

    #[test]
    fn test_input_size_resolution() {
        let fixed = VariantKind::Rmbg2.preprocessing().input_size;
        assert_eq!(fixed.resolve(100, 37), (1024, 1024));

        let dynamic = VariantKind::BiRefNet.preprocessing().input_size;
        assert_eq!(dynamic.resolve(100, 64), (128, 64));
        assert_eq!(dynamic.resolve(1, 1), (32, 32));
    }

    #[test]
    fn test_weight_source_falls_back_to_full_precision() {
        let catalog = builtin_catalog();
        let ben2 = catalog.iter().find(|d| d.id == "ben2").unwrap();
        let weights = ben2.weights.as_ref().unwrap();
        assert_eq!(
            weights.file_for(Precision::Half),
            ("BEN2_Base.onnx", Precision::Full)
        );

        let rmbg2 = catalog.iter().find(|d| d.id == "rmbg2").unwrap();
        let (file, precision) = rmbg2.weights.as_ref().unwrap().file_for(Precision::Half);
        assert_eq!(file, "onnx/model_fp16.onnx");
        assert_eq!(precision, Precision::Half);
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let descriptor = ModelDescriptor::new("rmbg2", "RMBG 2.0", VariantKind::Rmbg2, false);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["displayName"], "RMBG 2.0");
        assert_eq!(json["supportsRefinement"], false);
        assert_eq!(json["variant"], "rmbg2");
    }
}
