//! BiRefNet adapter with dynamic input resolution

use super::pipeline::OnnxPipeline;
use super::{ModelAdapter, RunOptions};
use crate::codec::CanonicalImage;
use crate::config::{Device, Precision};
use crate::error::Result;
use crate::models::AdapterMetadata;
use async_trait::async_trait;

/// BiRefNet: input rounded up to a multiple of 32 instead of a fixed square
pub struct BiRefNetAdapter {
    pipeline: OnnxPipeline,
}

impl BiRefNetAdapter {
    pub(crate) fn from_pipeline(pipeline: OnnxPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ModelAdapter for BiRefNetAdapter {
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

#[cfg(test)]
mod tests {
    use super::super::test_support::{descriptor, mock_factory, test_image};
    use super::super::AdapterFactory;
    use super::*;
    use crate::models::InputSize;

    #[tokio::test]
    async fn test_non_square_input_keeps_dimensions() {
        let mut adapter = mock_factory().create(&descriptor("birefnet")).unwrap();
        adapter.prepare(Device::Cpu, Precision::Full).await.unwrap();

        let output = adapter
            .run(&test_image(150, 70), &RunOptions::default())
            .unwrap();
        assert_eq!((output.width(), output.height()), (150, 70));
        assert_eq!(adapter.metadata().input_size, InputSize::MultipleOf(32));
    }

    #[tokio::test]
    async fn test_release_then_run_fails() {
        let mut adapter = mock_factory().create(&descriptor("birefnet")).unwrap();
        adapter.prepare(Device::Cpu, Precision::Full).await.unwrap();
        adapter.release();
        assert!(adapter
            .run(&test_image(32, 32), &RunOptions::default())
            .is_err());
    }
}
