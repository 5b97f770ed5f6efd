//! Eye-patch normalization into the canonical frame.
//!
//! Validates the raw buffer, converts to grayscale with fixed BT.601
//! luminance weights, center-crops to a square, resamples to
//! [`CANONICAL_SIZE`] and normalizes contrast so downstream thresholds do not
//! depend on exposure.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

use crate::error::{BiometricError, Result};
use crate::types::{EyeImage, NormalizedFrame, CANONICAL_SIZE, MAX_INPUT_DIMENSION};

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Contrast normalization applied after resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContrastMode {
    /// Linear stretch of the configured percentile range onto 0..=255.
    Stretch,
    /// Global histogram equalization.
    Equalize,
}

/// Configuration for [`ImagePreprocessor`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Minimum accepted width and height (pixels).
    pub min_dimension: u32,
    /// Maximum accepted width and height (pixels).
    pub max_dimension: u32,
    /// Contrast normalization mode.
    pub contrast: ContrastMode,
    /// Lower percentile mapped to black by [`ContrastMode::Stretch`].
    pub stretch_low: f32,
    /// Upper percentile mapped to white by [`ContrastMode::Stretch`].
    pub stretch_high: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            min_dimension: 64,
            max_dimension: MAX_INPUT_DIMENSION,
            contrast: ContrastMode::Stretch,
            stretch_low: 0.01,
            stretch_high: 0.99,
        }
    }
}

/// First pipeline stage: raw [`EyeImage`] → [`NormalizedFrame`].
#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, image: &EyeImage) -> Result<NormalizedFrame> {
        self.validate(image)?;

        let gray = to_gray(image)?;
        let (w, h) = gray.dimensions();
        let side = w.min(h);
        let square = if w == h {
            gray
        } else {
            imageops::crop_imm(&gray, (w - side) / 2, (h - side) / 2, side, side).to_image()
        };

        let resized = if side == CANONICAL_SIZE {
            square
        } else {
            imageops::resize(&square, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle)
        };

        let normalized = match self.config.contrast {
            ContrastMode::Stretch => {
                stretch_contrast(&resized, self.config.stretch_low, self.config.stretch_high)
            }
            ContrastMode::Equalize => imageproc::contrast::equalize_histogram(&resized),
        };

        tracing::debug!(
            src_width = w,
            src_height = h,
            channels = image.channels(),
            "preprocess: frame normalized"
        );

        NormalizedFrame::from_gray(normalized)
    }

    fn validate(&self, image: &EyeImage) -> Result<()> {
        let (w, h) = (image.width(), image.height());
        let (min, max) = (self.config.min_dimension, self.config.max_dimension);
        if w < min || h < min {
            return Err(BiometricError::InvalidImage(format!(
                "{w}x{h} is below the minimum {min}x{min}"
            )));
        }
        if w > max || h > max {
            return Err(BiometricError::InvalidImage(format!(
                "{w}x{h} exceeds the maximum {max}x{max}"
            )));
        }
        if !matches!(image.channels(), 1 | 3 | 4) {
            return Err(BiometricError::InvalidImage(format!(
                "unsupported channel count {}",
                image.channels()
            )));
        }
        let expected = w as usize * h as usize * image.channels() as usize;
        if image.data().len() != expected {
            return Err(BiometricError::InvalidImage(format!(
                "buffer holds {} bytes, expected {expected}",
                image.data().len()
            )));
        }
        Ok(())
    }
}

fn to_gray(image: &EyeImage) -> Result<GrayImage> {
    let channels = image.channels() as usize;
    let luma: Vec<u8> = if channels == 1 {
        image.data().to_vec()
    } else {
        image
            .data()
            .chunks_exact(channels)
            .map(|px| {
                let y = LUMA_R * px[0] as f32 + LUMA_G * px[1] as f32 + LUMA_B * px[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    };
    GrayImage::from_raw(image.width(), image.height(), luma)
        .ok_or_else(|| BiometricError::InvalidImage("buffer does not match dimensions".into()))
}

/// Map the `[low, high]` percentile range linearly onto 0..=255.
///
/// A frame whose percentile range collapses to a single value is returned
/// unchanged.
fn stretch_contrast(img: &GrayImage, low: f32, high: f32) -> GrayImage {
    let mut hist = [0u64; 256];
    for p in img.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total = img.width() as u64 * img.height() as u64;
    let lo = percentile(&hist, total, low);
    let hi = percentile(&hist, total, high);
    if hi <= lo {
        return img.clone();
    }

    let scale = 255.0 / (hi - lo) as f32;
    let mut lut = [0u8; 256];
    for (v, out) in lut.iter_mut().enumerate() {
        let mapped = (v as f32 - lo as f32) * scale;
        *out = mapped.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = img.clone();
    for p in out.pixels_mut() {
        *p = Luma([lut[p[0] as usize]]);
    }
    out
}

/// Smallest intensity whose cumulative share reaches `q`.
fn percentile(hist: &[u64; 256], total: u64, q: f32) -> u8 {
    let target = (q.clamp(0.0, 1.0) as f64 * total as f64).ceil().max(1.0) as u64;
    let mut acc = 0u64;
    for (v, &count) in hist.iter().enumerate() {
        acc += count;
        if acc >= target {
            return v as u8;
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_image(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> EyeImage {
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(f(x, y));
            }
        }
        EyeImage::from_raw(data, w, h, 1)
    }

    #[test]
    fn test_rejects_too_small() {
        let img = gray_image(32, 32, |_, _| 128);
        let err = ImagePreprocessor::default().normalize(&img).unwrap_err();
        assert!(matches!(err, BiometricError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_too_large() {
        let img = gray_image(1100, 80, |_, _| 128);
        let err = ImagePreprocessor::default().normalize(&img).unwrap_err();
        assert!(matches!(err, BiometricError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_buffer_mismatch() {
        let img = EyeImage::from_raw(vec![0u8; 100], 64, 64, 1);
        let err = ImagePreprocessor::default().normalize(&img).unwrap_err();
        assert!(matches!(err, BiometricError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_two_channels() {
        let img = EyeImage::from_raw(vec![0u8; 64 * 64 * 2], 64, 64, 2);
        let err = ImagePreprocessor::default().normalize(&img).unwrap_err();
        assert!(matches!(err, BiometricError::InvalidImage(_)));
    }

    #[test]
    fn test_output_is_canonical_size() {
        let img = gray_image(200, 150, |x, y| ((x + y) % 256) as u8);
        let frame = ImagePreprocessor::default().normalize(&img).unwrap();
        assert_eq!(frame.width(), CANONICAL_SIZE);
        assert_eq!(frame.height(), CANONICAL_SIZE);
    }

    #[test]
    fn test_rgb_uses_fixed_luminance_weights() {
        // Pure green at 200 → 0.587 * 200 = 117.4 → 117
        let data = [0u8, 200, 0].repeat(64 * 64);
        let img = EyeImage::from_raw(data, 64, 64, 3);
        let gray = to_gray(&img).unwrap();
        assert_eq!(gray.get_pixel(10, 10)[0], 117);
    }

    #[test]
    fn test_stretch_is_illumination_invariant() {
        // Same scene under two affine exposures normalizes to the same frame
        let scene = |x: u32, y: u32| (x * 7 + y * 3) % 100;
        let dim = gray_image(320, 320, |x, y| (20 + scene(x, y)) as u8);
        let bright = gray_image(320, 320, |x, y| (60 + 2 * scene(x, y)) as u8);
        let pre = ImagePreprocessor::default();
        let a = pre.normalize(&dim).unwrap();
        let b = pre.normalize(&bright).unwrap();
        let diff: u32 = a
            .image()
            .pixels()
            .zip(b.image().pixels())
            .map(|(p, q)| (p[0] as i32 - q[0] as i32).unsigned_abs())
            .max()
            .unwrap();
        assert!(diff <= 2, "max pixel difference {diff}");
    }

    #[test]
    fn test_flat_image_is_left_unchanged() {
        let img = gray_image(100, 100, |_, _| 90);
        let frame = ImagePreprocessor::default().normalize(&img).unwrap();
        assert!(frame.image().pixels().all(|p| p[0] == 90));
    }

    #[test]
    fn test_equalize_mode_spreads_histogram() {
        let img = gray_image(320, 320, |x, _| 100 + (x % 20) as u8);
        let config = PreprocessConfig {
            contrast: ContrastMode::Equalize,
            ..Default::default()
        };
        let frame = ImagePreprocessor::new(config).normalize(&img).unwrap();
        let max = frame.image().pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(max, 255);
    }
}
