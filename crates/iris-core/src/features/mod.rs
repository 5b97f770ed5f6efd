//! Iris-code extraction.
//!
//! The band between pupil and limbus is unwrapped onto a fixed polar grid,
//! collapsed into [`TEMPLATE_ROWS`] radial bands and filtered row-wise with a
//! small bank of complex Gabor filters. Each filter contributes the signs of
//! its real and imaginary responses, two bits per filter per cell.
//! Occluded cells and cells whose response is too weak to have a stable sign
//! are marked invalid in the mask.

mod gabor;
mod unwrap;

use crate::error::{BiometricError, Result};
use crate::types::{
    IrisGeometry, NormalizedFrame, Template, UnwrappedIris, CELL_BITS, TEMPLATE_BITS,
    TEMPLATE_COLS, TEMPLATE_ROWS, UNWRAP_COLS, UNWRAP_ROWS,
};
use gabor::GaborKernel;

/// Unwrapped rows averaged into one template row.
const ROWS_PER_BAND: usize = UNWRAP_ROWS / TEMPLATE_ROWS;

/// Filters in the bank. Each adds two bits per cell.
pub const FILTER_COUNT: usize = CELL_BITS / 2;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Filter wavelengths in angular texels.
    pub wavelengths: [f32; FILTER_COUNT],
    /// Gaussian envelope sigma as a multiple of the wavelength.
    pub sigma_ratio: f32,
    /// Minimum share of valid template bits.
    pub min_valid_fraction: f32,
    /// Responses with a smaller magnitude are masked as fragile.
    pub min_response: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            wavelengths: [8.0, 16.0],
            sigma_ratio: 0.5,
            min_valid_fraction: 0.4,
            min_response: 1e-3,
        }
    }
}

/// Fourth pipeline stage: frame + geometry → [`Template`].
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    kernels: Vec<GaborKernel>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let kernels = config
            .wavelengths
            .iter()
            .map(|&w| GaborKernel::new(w, config.sigma_ratio))
            .collect();
        Self { config, kernels }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn unwrap(&self, frame: &NormalizedFrame, geometry: &IrisGeometry) -> UnwrappedIris {
        unwrap::unwrap(frame, geometry)
    }

    pub fn encode(&self, unwrapped: &UnwrappedIris) -> Result<Template> {
        let mut bits = vec![(false, false); TEMPLATE_BITS];

        for t in 0..TEMPLATE_ROWS {
            let (row, valid) = band_row(unwrapped, t);
            for (f, kernel) in self.kernels.iter().enumerate() {
                for col in 0..TEMPLATE_COLS {
                    let (re, im) = kernel.respond(&row, col);
                    let stable = valid[col] && re.hypot(im) >= self.config.min_response;
                    let base = Template::bit_index(t, col, 2 * f);
                    bits[base] = (re >= 0.0, stable);
                    bits[base + 1] = (im >= 0.0, stable);
                }
            }
        }

        let template = Template::from_fn(|idx| bits[idx]);
        let valid_fraction = template.valid_fraction();
        if valid_fraction < self.config.min_valid_fraction {
            return Err(BiometricError::InsufficientValidRegion {
                valid_fraction,
                required: self.config.min_valid_fraction,
            });
        }
        tracing::debug!(valid_fraction, "features: template encoded");
        Ok(template)
    }

    pub fn extract(&self, frame: &NormalizedFrame, geometry: &IrisGeometry) -> Result<Template> {
        let unwrapped = self.unwrap(frame, geometry);
        self.encode(&unwrapped)
    }
}

/// Average `ROWS_PER_BAND` unwrapped rows into one zero-mean template row.
///
/// A column is valid when at least half of its texels are. Invalid columns
/// hold zero after mean removal, so they add nothing to neighboring responses.
fn band_row(unwrapped: &UnwrappedIris, band: usize) -> (Vec<f32>, Vec<bool>) {
    let mut row = vec![0.0f32; UNWRAP_COLS];
    let mut valid = vec![false; UNWRAP_COLS];

    for col in 0..UNWRAP_COLS {
        let mut sum = 0.0f32;
        let mut n = 0usize;
        for r in band * ROWS_PER_BAND..(band + 1) * ROWS_PER_BAND {
            if !unwrapped.is_occluded(r, col) {
                sum += unwrapped.texel(r, col);
                n += 1;
            }
        }
        if n * 2 >= ROWS_PER_BAND {
            row[col] = sum / n as f32;
            valid[col] = true;
        }
    }

    let (sum, n) = row
        .iter()
        .zip(&valid)
        .filter(|(_, &v)| v)
        .fold((0.0f32, 0usize), |(s, n), (x, _)| (s + x, n + 1));
    let mean = if n == 0 { 0.0 } else { sum / n as f32 };
    for (x, &v) in row.iter_mut().zip(&valid) {
        *x = if v { *x - mean } else { 0.0 };
    }
    (row, valid)
}
