//! Shared image pre- and post-processing for the model adapters
//!
//! Every adapter follows the same pipeline: flatten onto white, resize to the
//! variant's input size, normalize into an NCHW tensor, run the backend, turn
//! the first output channel into a mask at the original resolution, and write
//! it into the alpha channel.

use crate::{
    codec::CanonicalImage,
    error::{BgServeError, Result},
    models::{OutputActivation, PreprocessingConfig},
};
use image::{imageops::FilterType, GrayImage, Luma, RgbImage, RgbaImage};
use ndarray::Array4;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Drop alpha by compositing over a white background
    #[must_use]
    pub fn flatten_on_white(image: &CanonicalImage) -> RgbImage {
        if !image.has_alpha() {
            return image.as_dynamic().to_rgb8();
        }

        let rgba = image.to_rgba8();
        let mut rgb = RgbImage::new(rgba.width(), rgba.height());
        for (src, dst) in rgba.pixels().zip(rgb.pixels_mut()) {
            let alpha = f32::from(src[3]) / 255.0;
            for channel in 0..3 {
                let value = f32::from(src[channel]) * alpha + 255.0 * (1.0 - alpha);
                dst[channel] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
        rgb
    }

    /// Resize and normalize an RGB image into a `1x3xHxW` tensor
    ///
    /// # Errors
    /// - Resolved input size is zero or does not fit in memory indices
    pub fn to_tensor(rgb: &RgbImage, config: &PreprocessingConfig) -> Result<Array4<f32>> {
        let (width, height) = config.input_size.resolve(rgb.width(), rgb.height());
        if width == 0 || height == 0 {
            return Err(BgServeError::internal("model input size resolved to zero"));
        }

        let resized;
        let canvas = if rgb.dimensions() == (width, height) {
            rgb
        } else {
            resized = image::imageops::resize(rgb, width, height, FilterType::Triangle);
            &resized
        };

        Ok(Self::canvas_to_tensor(canvas, config))
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        let mean = config.normalization.mean;
        let std = config.normalization.std;

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (y, row) in canvas.rows().enumerate() {
            for (x, pixel) in row.enumerate() {
                for channel in 0..3 {
                    tensor[[0, channel, y, x]] =
                        (f32::from(pixel[channel]) / 255.0 - mean[channel]) / std[channel];
                }
            }
        }

        tensor
    }

    /// Turn the model output into an 8-bit mask at `width` x `height`
    ///
    /// # Errors
    /// - Output tensor is empty
    #[allow(clippy::indexing_slicing)]
    // Safe: mask dimensions are taken from the tensor shape
    pub fn mask_from_tensor(
        output: &Array4<f32>,
        activation: OutputActivation,
        width: u32,
        height: u32,
    ) -> Result<GrayImage> {
        let (batch, channels, mask_height, mask_width) = output.dim();
        if batch == 0 || channels == 0 || mask_height == 0 || mask_width == 0 {
            return Err(BgServeError::inference(format!(
                "model returned an empty mask tensor {:?}",
                output.dim()
            )));
        }

        let mut mask = GrayImage::new(mask_width as u32, mask_height as u32);
        for (x, y, pixel) in mask.enumerate_pixels_mut() {
            let raw = output[[0, 0, y as usize, x as usize]];
            let probability = match activation {
                OutputActivation::Sigmoid => 1.0 / (1.0 + (-raw).exp()),
                OutputActivation::Identity => raw,
            };
            let value = if probability.is_nan() {
                0.0
            } else {
                probability.clamp(0.0, 1.0)
            };
            *pixel = Luma([(value * 255.0).round() as u8]);
        }

        if mask.dimensions() == (width, height) {
            Ok(mask)
        } else {
            Ok(image::imageops::resize(
                &mask,
                width,
                height,
                FilterType::Triangle,
            ))
        }
    }

    /// Combine RGB pixels with a mask of the same size
    ///
    /// # Errors
    /// - Mask and image dimensions differ
    pub fn apply_alpha(rgb: &RgbImage, mask: &GrayImage) -> Result<RgbaImage> {
        if rgb.dimensions() != mask.dimensions() {
            return Err(BgServeError::internal(format!(
                "mask is {:?} but image is {:?}",
                mask.dimensions(),
                rgb.dimensions()
            )));
        }

        let mut rgba = RgbaImage::new(rgb.width(), rgb.height());
        for ((src, alpha), dst) in rgb.pixels().zip(mask.pixels()).zip(rgba.pixels_mut()) {
            dst.0 = [src[0], src[1], src[2], alpha[0]];
        }
        Ok(rgba)
    }

    /// Estimate clean foreground colours along soft mask edges
    ///
    /// Blur-fusion foreground estimation: a wide pass (box size 90) seeds
    /// foreground and background colour estimates, a narrow pass (box size 6)
    /// refines them. Removes background colour bleeding from
    /// semi-transparent pixels.
    ///
    /// # Errors
    /// - Mask and image dimensions differ
    pub fn refine_foreground(rgb: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        if rgb.dimensions() != mask.dimensions() {
            return Err(BgServeError::internal(
                "refinement mask does not match image dimensions",
            ));
        }

        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let alpha: Vec<f32> = mask.pixels().map(|p| f32::from(p[0]) / 255.0).collect();
        let image = split_channels(rgb);

        let (foreground, blurred_background) =
            blur_fusion_pass(&image, &image, &image, &alpha, width, height, 90);
        let (foreground, _) = blur_fusion_pass(
            &image,
            &foreground,
            &blurred_background,
            &alpha,
            width,
            height,
            6,
        );

        let mut refined = RgbImage::new(rgb.width(), rgb.height());
        for (index, pixel) in refined.pixels_mut().enumerate() {
            for (channel, plane) in foreground.iter().enumerate() {
                let value = plane.get(index).copied().unwrap_or(0.0);
                pixel[channel] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
        Ok(refined)
    }
}

type Planes = [Vec<f32>; 3];

fn split_channels(rgb: &RgbImage) -> Planes {
    let len = rgb.width() as usize * rgb.height() as usize;
    let mut planes: Planes = [
        Vec::with_capacity(len),
        Vec::with_capacity(len),
        Vec::with_capacity(len),
    ];
    for pixel in rgb.pixels() {
        for (channel, plane) in planes.iter_mut().enumerate() {
            plane.push(f32::from(pixel[channel]) / 255.0);
        }
    }
    planes
}

/// One foreground/background estimation pass with box size `size`
#[allow(clippy::indexing_slicing)]
// Safe: every plane has width * height elements
fn blur_fusion_pass(
    image: &Planes,
    foreground: &Planes,
    background: &Planes,
    alpha: &[f32],
    width: usize,
    height: usize,
    size: usize,
) -> (Planes, Planes) {
    const EPS: f32 = 1e-5;
    let blurred_alpha = box_blur(alpha, width, height, size);

    let mut next_foreground: Planes = Default::default();
    let mut blurred_background: Planes = Default::default();

    for channel in 0..3 {
        let fa: Vec<f32> = foreground[channel]
            .iter()
            .zip(alpha)
            .map(|(f, a)| f * a)
            .collect();
        let b1a: Vec<f32> = background[channel]
            .iter()
            .zip(alpha)
            .map(|(b, a)| b * (1.0 - a))
            .collect();
        let blurred_fa = box_blur(&fa, width, height, size);
        let blurred_b1a = box_blur(&b1a, width, height, size);

        let mut f_out = Vec::with_capacity(alpha.len());
        let mut b_out = Vec::with_capacity(alpha.len());
        for i in 0..alpha.len() {
            let a = alpha[i];
            let blurred_f = blurred_fa[i] / (blurred_alpha[i] + EPS);
            let blurred_b = blurred_b1a[i] / ((1.0 - blurred_alpha[i]) + EPS);
            let f = blurred_f + a * (image[channel][i] - a * blurred_f - (1.0 - a) * blurred_b);
            f_out.push(f.clamp(0.0, 1.0));
            b_out.push(blurred_b);
        }
        next_foreground[channel] = f_out;
        blurred_background[channel] = b_out;
    }

    (next_foreground, blurred_background)
}

/// Mean filter over a `size` x `size` window, clipped at the borders
#[allow(clippy::indexing_slicing)]
// Safe: integral image is (width + 1) * (height + 1) and bounds are clamped
fn box_blur(plane: &[f32], width: usize, height: usize, size: usize) -> Vec<f32> {
    let stride = width + 1;
    let mut integral = vec![0.0f64; stride * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0.0f64;
        for x in 0..width {
            row_sum += f64::from(plane[y * width + x]);
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
        }
    }

    let size = size.max(1);
    let before = size / 2;
    let after = size - before;
    let mut out = Vec::with_capacity(plane.len());
    for y in 0..height {
        let y0 = y.saturating_sub(before);
        let y1 = (y + after).min(height);
        for x in 0..width {
            let x0 = x.saturating_sub(before);
            let x1 = (x + after).min(width);
            let sum = integral[y1 * stride + x1] - integral[y0 * stride + x1]
                - integral[y1 * stride + x0]
                + integral[y0 * stride + x0];
            let count = ((y1 - y0) * (x1 - x0)) as f64;
            out.push((sum / count) as f32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InputSize, Normalization, VariantKind};
    use image::{DynamicImage, Rgb, Rgba};

    fn create_test_image() -> RgbImage {
        RgbImage::from_pixel(100, 60, Rgb([255, 0, 0]))
    }

    #[test]
    fn test_fixed_size_tensor_shape() {
        let config = VariantKind::Rmbg2.preprocessing();
        let tensor = ImagePreprocessor::to_tensor(&create_test_image(), &config).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 1024, 1024]);
    }

    #[test]
    fn test_dynamic_size_rounds_up() {
        let config = VariantKind::BiRefNet.preprocessing();
        let tensor = ImagePreprocessor::to_tensor(&create_test_image(), &config).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 64, 128]);
    }

    #[test]
    fn test_normalization_values() {
        let config = PreprocessingConfig {
            input_size: InputSize::Fixed {
                width: 4,
                height: 4,
            },
            normalization: Normalization::IMAGENET,
            output_activation: OutputActivation::Sigmoid,
        };
        let rgb = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let tensor = ImagePreprocessor::to_tensor(&rgb, &config).unwrap();

        let expected_r = (1.0 - 0.485) / 0.229;
        let expected_g = (0.0 - 0.456) / 0.224;
        assert!((tensor[[0, 0, 2, 2]] - expected_r).abs() < 1e-5);
        assert!((tensor[[0, 1, 2, 2]] - expected_g).abs() < 1e-5);
    }

    #[test]
    fn test_flatten_on_white() {
        let mut rgba = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let canonical = CanonicalImage::from_dynamic(DynamicImage::ImageRgba8(rgba)).unwrap();

        let flattened = ImagePreprocessor::flatten_on_white(&canonical);
        assert_eq!(flattened.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flattened.get_pixel(1, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_mask_sigmoid_and_resize() {
        let mut output = Array4::<f32>::from_elem((1, 1, 8, 8), -20.0);
        output[[0, 0, 4, 4]] = 20.0;

        let mask =
            ImagePreprocessor::mask_from_tensor(&output, OutputActivation::Sigmoid, 8, 8).unwrap();
        assert_eq!(mask.get_pixel(4, 4)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);

        let resized =
            ImagePreprocessor::mask_from_tensor(&output, OutputActivation::Sigmoid, 100, 50)
                .unwrap();
        assert_eq!(resized.dimensions(), (100, 50));
    }

    #[test]
    fn test_mask_rejects_empty_tensor() {
        let output = Array4::<f32>::zeros((1, 0, 8, 8));
        assert!(
            ImagePreprocessor::mask_from_tensor(&output, OutputActivation::Identity, 8, 8)
                .is_err()
        );
    }

    #[test]
    fn test_apply_alpha() {
        let rgb = RgbImage::from_pixel(3, 3, Rgb([10, 20, 30]));
        let mask = GrayImage::from_pixel(3, 3, Luma([77]));
        let rgba = ImagePreprocessor::apply_alpha(&rgb, &mask).unwrap();
        assert_eq!(rgba.get_pixel(1, 1), &Rgba([10, 20, 30, 77]));

        let wrong = GrayImage::new(2, 2);
        assert!(ImagePreprocessor::apply_alpha(&rgb, &wrong).is_err());
    }

    #[test]
    fn test_box_blur_constant_plane_is_unchanged() {
        let plane = vec![0.5f32; 20 * 10];
        let blurred = box_blur(&plane, 20, 10, 6);
        assert!(blurred.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_refinement_keeps_opaque_foreground() {
        let rgb = RgbImage::from_pixel(16, 16, Rgb([200, 40, 40]));
        let mask = GrayImage::from_pixel(16, 16, Luma([255]));
        let refined = ImagePreprocessor::refine_foreground(&rgb, &mask).unwrap();
        let pixel = refined.get_pixel(8, 8);
        assert!((i32::from(pixel[0]) - 200).abs() <= 1);
        assert!((i32::from(pixel[1]) - 40).abs() <= 1);
    }

    #[test]
    fn test_refinement_removes_background_bleed() {
        // Left half red foreground, right half blue background, soft edge in the middle
        let mut rgb = RgbImage::new(32, 8);
        let mut mask = GrayImage::new(32, 8);
        for (x, _, pixel) in rgb.enumerate_pixels_mut() {
            *pixel = if x < 16 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) };
        }
        for (x, _, pixel) in mask.enumerate_pixels_mut() {
            *pixel = Luma([if x < 15 { 255 } else if x == 15 { 128 } else { 0 }]);
        }
        // Edge pixel carries a red/blue mix
        for y in 0..8 {
            rgb.put_pixel(15, y, Rgb([128, 0, 127]));
        }

        let refined = ImagePreprocessor::refine_foreground(&rgb, &mask).unwrap();
        let edge = refined.get_pixel(15, 4);
        assert!(edge[0] > edge[2], "edge colour should move towards the foreground");
    }
}
