//! BRIA RMBG-2.0 segmentation adapter

use super::pipeline::OnnxPipeline;
use super::{ModelAdapter, RunOptions};
use crate::codec::CanonicalImage;
use crate::config::{Device, Precision};
use crate::error::Result;
use crate::models::AdapterMetadata;
use async_trait::async_trait;

/// RMBG-2.0: fixed 1024x1024 input, ImageNet normalization, logit output
pub struct Rmbg2Adapter {
    pipeline: OnnxPipeline,
}

impl Rmbg2Adapter {
    pub(crate) fn from_pipeline(pipeline: OnnxPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ModelAdapter for Rmbg2Adapter {
    async fn stage(&mut self, _device: Device, precision: Precision) -> Result<()> {
        self.pipeline.stage(precision).await
    }

    async fn prepare(&mut self, device: Device, precision: Precision) -> Result<()> {
        self.pipeline.prepare(device, precision).await
    }

    fn run(&mut self, image: &CanonicalImage, _options: &RunOptions) -> Result<CanonicalImage> {
        let (rgb, mask) = self.pipeline.predict(image)?;
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
