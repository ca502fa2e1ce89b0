//! BEN2 matting adapter
//!
//! BEN2 predicts a soft alpha matte directly (no sigmoid) and optionally
//! re-estimates foreground colours around the matte edges so hair and
//! semi-transparent regions do not carry the old background.

use super::pipeline::OnnxPipeline;
use super::{ModelAdapter, RunOptions};
use crate::codec::CanonicalImage;
use crate::config::{Device, Precision};
use crate::error::Result;
use crate::models::AdapterMetadata;
use crate::utils::ImagePreprocessor;
use async_trait::async_trait;
use tracing::debug;

pub struct Ben2Adapter {
    pipeline: OnnxPipeline,
}

impl Ben2Adapter {
    pub(crate) fn from_pipeline(pipeline: OnnxPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ModelAdapter for Ben2Adapter {
    async fn stage(&mut self, _device: Device, precision: Precision) -> Result<()> {
        self.pipeline.stage(precision).await
    }

    async fn prepare(&mut self, device: Device, precision: Precision) -> Result<()> {
        self.pipeline.prepare(device, precision).await
    }

    fn run(&mut self, image: &CanonicalImage, options: &RunOptions) -> Result<CanonicalImage> {
        let (rgb, mask) = self.pipeline.predict(image)?;
        if options.enable_refinement {
            debug!(model = %self.pipeline.descriptor().id, "refining foreground");
            let refined = ImagePreprocessor::refine_foreground(&rgb, &mask)?;
            return OnnxPipeline::compose(&refined, &mask);
        }
        OnnxPipeline::compose(&rgb, &mask)
    }

    fn clear_cache(&mut self) -> Result<()> {
        self.pipeline.clear_cache()
    }

    fn release(&mut self) {
        self.pipeline.release();
    }

    fn metadata(&self) -> AdapterMetadata {
        self.pipeline.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{descriptor, mock_factory};
    use super::super::AdapterFactory;
    use super::*;
    use crate::models::ModelType;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn split_image() -> CanonicalImage {
        let image = RgbaImage::from_fn(60, 60, |x, _| {
            if x < 30 {
                Rgba([220, 20, 20, 255])
            } else {
                Rgba([20, 20, 220, 255])
            }
        });
        CanonicalImage::from_dynamic(DynamicImage::ImageRgba8(image)).unwrap()
    }

    #[tokio::test]
    async fn test_half_precision_request_runs_full() {
        let mut adapter = mock_factory().create(&descriptor("ben2")).unwrap();
        adapter.prepare(Device::Cpu, Precision::Half).await.unwrap();

        let metadata = adapter.metadata();
        assert_eq!(metadata.precision, Precision::Full);
        assert_eq!(metadata.model_type, ModelType::Matting);
        assert!(metadata.supports_refinement);
    }

    #[tokio::test]
    async fn test_refinement_changes_colours_not_alpha() {
        let mut adapter = mock_factory().create(&descriptor("ben2")).unwrap();
        adapter.prepare(Device::Cpu, Precision::Full).await.unwrap();

        let image = split_image();
        let plain = adapter
            .run(&image, &RunOptions::default())
            .unwrap()
            .to_rgba8();
        let refined = adapter
            .run(
                &image,
                &RunOptions {
                    enable_refinement: true,
                },
            )
            .unwrap()
            .to_rgba8();

        assert_eq!(plain.dimensions(), refined.dimensions());
        let alpha_equal = plain
            .pixels()
            .zip(refined.pixels())
            .all(|(a, b)| a[3] == b[3]);
        assert!(alpha_equal);
        assert_ne!(plain, refined);
    }
}
