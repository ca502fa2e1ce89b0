//! Instrumented adapters shared by the integration tests
//!
//! [`Recorder`] records what the registry and dispatch service did to the
//! adapters: how many times each model was created and prepared, how many
//! runs were on the "accelerator" at once, and the order of lifecycle events.

#![allow(dead_code)]

use async_trait::async_trait;
use bgremove_serve::{
    AdapterFactory, AdapterMetadata, BgServeError, CanonicalImage, Device, ExecutionProvider,
    InferenceDispatchService, InputSize, ModelAdapter, ModelDescriptor, ModelType, Precision,
    Result, RunOptions, ServiceConfig, ServiceConfigBuilder, VariantKind,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared instrumentation for every adapter a factory creates
#[derive(Debug, Default)]
pub struct Recorder {
    creates: Mutex<HashMap<String, usize>>,
    prepares: Mutex<HashMap<String, usize>>,
    releases: AtomicUsize,
    active_runs: AtomicUsize,
    peak_runs: AtomicUsize,
    total_runs: AtomicUsize,
    events: Mutex<Vec<String>>,
    pub prepare_delay: Mutex<Duration>,
    pub run_delay: Mutex<Duration>,
    pub fail_prepare: AtomicBool,
    pub fail_run: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_prepare_delay(&self, delay: Duration) {
        *self.prepare_delay.lock().unwrap() = delay;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    pub fn creates(&self, id: &str) -> usize {
        self.creates.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn prepares(&self, id: &str) -> usize {
        self.prepares.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn peak_runs(&self) -> usize {
        self.peak_runs.load(Ordering::SeqCst)
    }

    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn total_runs(&self) -> usize {
        self.total_runs.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn bump(map: &Mutex<HashMap<String, usize>>, id: &str) {
        *map.lock().unwrap().entry(id.to_string()).or_default() += 1;
    }
}

/// Adapter that marks a centred square as foreground
pub struct InstrumentedAdapter {
    descriptor: ModelDescriptor,
    recorder: Arc<Recorder>,
    placement: Option<(Device, Precision)>,
}

#[async_trait]
impl ModelAdapter for InstrumentedAdapter {
    async fn prepare(&mut self, device: Device, precision: Precision) -> Result<()> {
        let id = self.descriptor.id.clone();
        self.recorder.record(format!("prepare:start:{id}"));
        let delay = *self.recorder.prepare_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Recorder::bump(&self.recorder.prepares, &id);
        if self.recorder.fail_prepare.load(Ordering::SeqCst) {
            self.recorder.record(format!("prepare:failed:{id}"));
            return Err(BgServeError::model_load_failed(&id, "weights unavailable"));
        }
        self.placement = Some((device, precision));
        self.recorder.record(format!("prepare:end:{id}"));
        Ok(())
    }

    fn run(&mut self, image: &CanonicalImage, _options: &RunOptions) -> Result<CanonicalImage> {
        if self.placement.is_none() {
            return Err(BgServeError::inference("not prepared"));
        }
        let id = &self.descriptor.id;
        let active = self.recorder.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak_runs.fetch_max(active, Ordering::SeqCst);
        self.recorder.total_runs.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(format!("run:start:{id}"));

        let delay = *self.recorder.run_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.recorder.record(format!("run:end:{id}"));
        self.recorder.active_runs.fetch_sub(1, Ordering::SeqCst);
        if self.recorder.fail_run.load(Ordering::SeqCst) {
            return Err(BgServeError::inference(
                "tensor shape mismatch at /opt/models/secret/layer42",
            ));
        }

        let (width, height) = (image.width(), image.height());
        let mut rgba = image.to_rgba8();
        for (x, y, pixel) in rgba.enumerate_pixels_mut() {
            let inside = x >= width / 4 && x < width * 3 / 4 && y >= height / 4 && y < height * 3 / 4;
            pixel[3] = if inside { 255 } else { 0 };
        }
        Ok(CanonicalImage::from_rgba(rgba))
    }

    fn clear_cache(&mut self) -> Result<()> {
        self.recorder.record(format!("clear:{}", self.descriptor.id));
        Ok(())
    }

    fn release(&mut self) {
        self.placement = None;
        self.recorder.releases.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(format!("release:{}", self.descriptor.id));
    }

    fn metadata(&self) -> AdapterMetadata {
        let (device, precision) = self.placement.unwrap_or((Device::Cpu, Precision::Full));
        AdapterMetadata {
            variant: self.descriptor.variant,
            display_name: self.descriptor.display_name.clone(),
            model_type: ModelType::Segmentation,
            supports_refinement: self.descriptor.supports_refinement,
            device,
            precision,
            input_size: InputSize::Fixed {
                width: 64,
                height: 64,
            },
        }
    }
}

/// Factory producing [`InstrumentedAdapter`]s that share one recorder
#[derive(Debug, Clone)]
pub struct InstrumentedFactory {
    pub recorder: Arc<Recorder>,
}

impl AdapterFactory for InstrumentedFactory {
    fn create(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelAdapter>> {
        Recorder::bump(&self.recorder.creates, &descriptor.id);
        Ok(Box::new(InstrumentedAdapter {
            descriptor: descriptor.clone(),
            recorder: Arc::clone(&self.recorder),
            placement: None,
        }))
    }
}

/// Three models mirroring the built-in catalog, without weight sources
pub fn catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("rmbg2", "RMBG 2.0", VariantKind::Rmbg2, false),
        ModelDescriptor::new("ben2", "BEN2", VariantKind::Ben2, true),
        ModelDescriptor::new("birefnet", "BiRefNet", VariantKind::BiRefNet, false),
    ]
}

/// CPU-only configuration with short timeouts
pub fn test_builder() -> ServiceConfigBuilder {
    ServiceConfig::builder()
        .execution_provider(ExecutionProvider::Cpu)
        .gate_capacity(2)
        .inference_timeout(Duration::from_secs(5))
        .load_timeout(Duration::from_secs(5))
        .unload_timeout(Duration::from_millis(200))
}

pub fn test_config() -> ServiceConfig {
    test_builder().build().unwrap()
}

pub fn service_with(config: ServiceConfig) -> (Arc<InferenceDispatchService>, Arc<Recorder>) {
    let recorder = Recorder::new();
    let factory = InstrumentedFactory {
        recorder: Arc::clone(&recorder),
    };
    let service =
        InferenceDispatchService::with_factory(config, catalog(), Arc::new(factory)).unwrap();
    (Arc::new(service), recorder)
}

pub fn service() -> (Arc<InferenceDispatchService>, Arc<Recorder>) {
    service_with(test_config())
}

/// Opaque RGB PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 80, 40]));
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Alpha value at `(x, y)` of an encoded PNG
pub fn alpha_at(png: &[u8], x: u32, y: u32) -> u8 {
    let image = image::load_from_memory(png).unwrap().to_rgba8();
    let Rgba([_, _, _, alpha]) = *image.get_pixel(x, y);
    alpha
}
