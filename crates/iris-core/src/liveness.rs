//! Passive single-frame liveness and quality gate.
//!
//! A live eye under a point illuminator shows a few small, sharp corneal
//! reflections near the pupil, a crisp pupil/iris boundary and a clearly
//! darker pupil. A matte print loses the reflections, a screen replay tends
//! to produce large diffuse glare, and both usually lose sharpness.
//!
//! The gate combines three cues into one score in [0, 1]:
//!
//! - **Sharpness**: mean squared Scharr gradient over the iris bounding box.
//! - **Specular plausibility**: count and size of bright blobs in the central
//!   iris disk.
//! - **Contrast**: iris band mean minus pupil mean.
//!
//! # Threat coverage
//!
//! - **Blocks:** matte prints, blurred captures, images with broad glare.
//! - **Does not block:** glossy prints with a point reflection, contact-lens
//!   or prosthetic-eye attacks, high-quality screen replays.

use image::{GrayImage, Luma};
use imageproc::gradients::{horizontal_scharr, vertical_scharr};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::error::{BiometricError, Result};
use crate::types::{Circle, IrisGeometry, NormalizedFrame};

/// Scharr response of a full-range step edge, used to scale gradients to ~[0, 1].
const SCHARR_SCALE: f32 = 32.0 * 255.0;

/// Configuration for [`LivenessGate`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Raw sharpness below this fails with `LowQuality` before scoring.
    pub sharpness_floor: f32,
    /// Raw sharpness mapped to a full sharpness score.
    pub sharpness_reference: f32,
    /// Intensity at or above which a pixel belongs to a highlight.
    pub highlight_threshold: f32,
    /// Highlights are searched within this fraction of the iris radius.
    pub highlight_search_radius: f32,
    /// At least one highlight must lie within this fraction of the iris
    /// radius for a full specular score.
    pub highlight_near_radius: f32,
    /// Most small highlights still considered plausible.
    pub max_highlights: usize,
    /// Largest highlight area (pixels) still considered a point reflection.
    pub max_highlight_area: u32,
    /// Band/pupil intensity gap mapped to a full contrast score.
    pub contrast_reference: f32,
    pub sharpness_weight: f32,
    pub specular_weight: f32,
    pub contrast_weight: f32,
    /// Combined score below this fails with `LivenessRejected`.
    pub threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sharpness_floor: 1e-4,
            sharpness_reference: 1e-3,
            highlight_threshold: 0.94,
            highlight_search_radius: 0.85,
            highlight_near_radius: 0.6,
            max_highlights: 4,
            max_highlight_area: 200,
            contrast_reference: 0.25,
            sharpness_weight: 0.2,
            specular_weight: 0.55,
            contrast_weight: 0.25,
            threshold: 0.5,
        }
    }
}

/// Per-cue measurements and the combined score.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LivenessReport {
    /// Mean normalized gradient energy over the iris bounding box.
    pub sharpness: f32,
    pub sharpness_score: f32,
    /// Small bright blobs found in the central iris disk.
    pub highlight_count: usize,
    /// Bright blobs too large to be point reflections.
    pub diffuse_highlights: usize,
    pub specular_score: f32,
    /// Iris band mean minus pupil mean, in intensity units.
    pub contrast: f32,
    pub contrast_score: f32,
    pub score: f32,
}

/// Third pipeline stage. Runs on the canonical frame before feature extraction.
#[derive(Debug, Clone, Default)]
pub struct LivenessGate {
    config: LivenessConfig,
}

impl LivenessGate {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Measure every cue without judging.
    pub fn assess(&self, frame: &NormalizedFrame, geometry: &IrisGeometry) -> LivenessReport {
        let cfg = &self.config;

        let sharpness = gradient_energy(frame.image(), &geometry.iris);
        let sharpness_score = saturate(sharpness / cfg.sharpness_reference);

        let (highlight_count, diffuse_highlights, any_near) = self.highlights(frame, geometry);
        let mut specular_score =
            if diffuse_highlights == 0 && (1..=cfg.max_highlights).contains(&highlight_count) {
                1.0
            } else {
                0.0
            };
        if specular_score > 0.0 && !any_near {
            specular_score *= 0.5;
        }

        let contrast = band_mean(frame, geometry) - pupil_mean(frame, &geometry.pupil, cfg);
        let contrast_score = saturate(contrast / cfg.contrast_reference);

        let weight_sum = cfg.sharpness_weight + cfg.specular_weight + cfg.contrast_weight;
        let score = if weight_sum > 0.0 {
            saturate(
                (cfg.sharpness_weight * sharpness_score
                    + cfg.specular_weight * specular_score
                    + cfg.contrast_weight * contrast_score)
                    / weight_sum,
            )
        } else {
            0.0
        };

        let report = LivenessReport {
            sharpness,
            sharpness_score,
            highlight_count,
            diffuse_highlights,
            specular_score,
            contrast,
            contrast_score,
            score,
        };
        tracing::debug!(?report, "liveness: assessed");
        report
    }

    /// Assess and apply the quality floor and the score threshold.
    pub fn check(&self, frame: &NormalizedFrame, geometry: &IrisGeometry) -> Result<LivenessReport> {
        let report = self.assess(frame, geometry);
        if report.sharpness < self.config.sharpness_floor {
            return Err(BiometricError::LowQuality {
                sharpness: report.sharpness,
                floor: self.config.sharpness_floor,
            });
        }
        if report.score < self.config.threshold {
            return Err(BiometricError::LivenessRejected {
                score: report.score,
                threshold: self.config.threshold,
            });
        }
        Ok(report)
    }

    /// Returns (small highlights, diffuse highlights, any highlight near the pupil).
    fn highlights(&self, frame: &NormalizedFrame, geometry: &IrisGeometry) -> (usize, usize, bool) {
        let cfg = &self.config;
        let (w, h) = (frame.width(), frame.height());
        let pupil = &geometry.pupil;
        let disk = Circle::new(pupil.x, pupil.y, cfg.highlight_search_radius * geometry.iris.r);

        let mut bright = GrayImage::new(w, h);
        for (x, y, p) in frame.image().enumerate_pixels() {
            if p[0] as f32 / 255.0 >= cfg.highlight_threshold && disk.contains(x as f32, y as f32) {
                bright.put_pixel(x, y, Luma([255]));
            }
        }

        let labels = connected_components(&bright, Connectivity::Eight, Luma([0u8]));
        let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        if max_label == 0 {
            return (0, 0, false);
        }

        // (area, sum_x, sum_y) per label
        let mut blobs = vec![(0u32, 0f64, 0f64); max_label + 1];
        for (x, y, p) in labels.enumerate_pixels() {
            let label = p[0] as usize;
            if label != 0 {
                let b = &mut blobs[label];
                b.0 += 1;
                b.1 += x as f64;
                b.2 += y as f64;
            }
        }

        let near_r = cfg.highlight_near_radius * geometry.iris.r;
        let mut small = 0;
        let mut diffuse = 0;
        let mut any_near = false;
        for &(area, sx, sy) in blobs.iter().skip(1).filter(|b| b.0 > 0) {
            if area > cfg.max_highlight_area {
                diffuse += 1;
                continue;
            }
            small += 1;
            let cx = (sx / area as f64) as f32;
            let cy = (sy / area as f64) as f32;
            if pupil.distance_to(cx, cy) <= near_r {
                any_near = true;
            }
        }
        (small, diffuse, any_near)
    }
}

fn saturate(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Mean of `(gx² + gy²) / SCHARR_SCALE²` over the iris bounding box.
fn gradient_energy(img: &GrayImage, iris: &Circle) -> f32 {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let gx = horizontal_scharr(img);
    let gy = vertical_scharr(img);

    // Skip the one-pixel border where the filter is clamped.
    let x0 = ((iris.x - iris.r).floor().max(1.0) as u32).min(w - 2);
    let x1 = ((iris.x + iris.r).ceil().max(1.0) as u32).min(w - 2);
    let y0 = ((iris.y - iris.r).floor().max(1.0) as u32).min(h - 2);
    let y1 = ((iris.y + iris.r).ceil().max(1.0) as u32).min(h - 2);

    let mut sum = 0.0f64;
    let mut n = 0u64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let a = gx.get_pixel(x, y)[0] as f32 / SCHARR_SCALE;
            let b = gy.get_pixel(x, y)[0] as f32 / SCHARR_SCALE;
            sum += (a * a + b * b) as f64;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64) as f32
    }
}

fn band_mean(frame: &NormalizedFrame, geometry: &IrisGeometry) -> f32 {
    let iris = &geometry.iris;
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let x0 = ((iris.x - iris.r).floor() as i64).max(0);
    let x1 = ((iris.x + iris.r).ceil() as i64).min(w - 1);
    let y0 = ((iris.y - iris.r).floor() as i64).max(0);
    let y1 = ((iris.y + iris.r).ceil() as i64).min(h - 1);

    let mut sum = 0.0f32;
    let mut n = 0u32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if geometry.in_band(x as f32, y as f32) && !geometry.occlusion.is_occluded(x, y) {
                sum += frame.intensity(x as u32, y as u32);
                n += 1;
            }
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

fn pupil_mean(frame: &NormalizedFrame, pupil: &Circle, cfg: &LivenessConfig) -> f32 {
    let inner = Circle::new(pupil.x, pupil.y, pupil.r * 0.8);
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let x0 = ((inner.x - inner.r).floor() as i64).max(0);
    let x1 = ((inner.x + inner.r).ceil() as i64).min(w - 1);
    let y0 = ((inner.y - inner.r).floor() as i64).max(0);
    let y1 = ((inner.y + inner.r).ceil() as i64).min(h - 1);

    let mut sum = 0.0f32;
    let mut n = 0u32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if !inner.contains(x as f32, y as f32) {
                continue;
            }
            let v = frame.intensity(x as u32, y as u32);
            if v < cfg.highlight_threshold {
                sum += v;
                n += 1;
            }
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}
