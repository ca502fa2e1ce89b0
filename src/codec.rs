//! Image decoding and PNG encoding for uploaded images

use crate::config::ImageLimits;
use crate::error::{BgServeError, Result};
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use std::io::Cursor;

/// Decoded image in the service's canonical 8-bit RGB or RGBA layout
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalImage {
    image: DynamicImage,
}

impl CanonicalImage {
    /// Normalize any supported pixel layout to 8-bit RGB or RGBA
    ///
    /// Grayscale and 16-bit inputs are widened or narrowed; floating point
    /// layouts are rejected as an unsupported mode.
    ///
    /// # Errors
    /// - Unsupported color mode
    /// - Zero-sized image
    pub fn from_dynamic(image: DynamicImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(BgServeError::invalid_image("image has zero width or height"));
        }

        let image = match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image,
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb16(_) | DynamicImage::ImageLuma16(_) => {
                DynamicImage::ImageRgb8(image.to_rgb8())
            },
            DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgba16(_) => DynamicImage::ImageRgba8(image.to_rgba8()),
            other => {
                return Err(BgServeError::invalid_image(format!(
                    "unsupported color mode {:?}",
                    other.color()
                )))
            },
        };

        Ok(Self { image })
    }

    /// Wrap an RGBA buffer
    #[must_use]
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self {
            image: DynamicImage::ImageRgba8(image),
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Number of channels (3 or 4)
    #[must_use]
    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.image.color().has_alpha()
    }

    /// Borrow the underlying pixel buffer
    #[must_use]
    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// Copy the pixels out as RGBA8
    #[must_use]
    pub fn to_rgba8(&self) -> RgbaImage {
        self.image.to_rgba8()
    }

    #[must_use]
    pub fn into_dynamic(self) -> DynamicImage {
        self.image
    }
}

/// Decodes upload blobs and encodes results, enforcing input limits
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec {
    limits: ImageLimits,
}

impl ImageCodec {
    #[must_use]
    pub fn new(limits: ImageLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> ImageLimits {
        self.limits
    }

    /// Decode an uploaded blob into a canonical image
    ///
    /// # Errors
    /// Every failure is reported as `InvalidImage`:
    /// - empty or oversized input
    /// - unrecognized or corrupt encoding
    /// - decoded dimensions above the pixel limit
    /// - unsupported color mode
    pub fn decode(&self, bytes: &[u8]) -> Result<CanonicalImage> {
        if bytes.is_empty() {
            return Err(BgServeError::invalid_image("image data is empty"));
        }
        if bytes.len() > self.limits.max_bytes {
            return Err(BgServeError::invalid_image(format!(
                "image is {} bytes, limit is {}",
                bytes.len(),
                self.limits.max_bytes
            )));
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| BgServeError::invalid_image(format!("failed to read image: {e}")))?;
        if reader.format().is_none() {
            return Err(BgServeError::invalid_image("unrecognized image format"));
        }

        let mut decoder_limits = image::Limits::default();
        // 16 bytes per pixel covers the widest layout (RGBA f32)
        decoder_limits.max_alloc = Some(self.limits.max_pixels.saturating_mul(16));
        reader.limits(decoder_limits);

        let decoded = reader
            .decode()
            .map_err(|e| BgServeError::invalid_image(format!("failed to decode image: {e}")))?;

        let pixels = u64::from(decoded.width()) * u64::from(decoded.height());
        if pixels > self.limits.max_pixels {
            return Err(BgServeError::invalid_image(format!(
                "image is {}x{} ({pixels} pixels), limit is {}",
                decoded.width(),
                decoded.height(),
                self.limits.max_pixels
            )));
        }

        CanonicalImage::from_dynamic(decoded)
    }

    /// Encode a canonical image as PNG, preserving alpha
    ///
    /// # Errors
    /// - PNG encoder failure
    pub fn encode_png(&self, image: &CanonicalImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        image
            .as_dynamic()
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| BgServeError::internal(format!("Failed to encode PNG: {e}")))?;
        Ok(buffer)
    }
}
