//! Pupil and limbus localization with occlusion masking.
//!
//! Stages, in order:
//!
//! 1. Gaussian smoothing of the canonical frame.
//! 2. Pupil candidate: darkest-percentile threshold, morphological
//!    close/open, largest round connected component near the center.
//! 3. Pupil refinement: integro-differential search around the candidate.
//! 4. Limbus: integro-differential search over the lateral sectors, which
//!    eyelids rarely cover, for radii beyond the pupil.
//! 5. Occlusion: eyelid lines, eyelashes and reflections inside the band.
//!
//! Every search is exhaustive over a fixed grid, so the result is a
//! deterministic function of the input pixels.

mod boundary;
mod occlusion;
mod pupil;

use image::GrayImage;

use crate::error::{BiometricError, Result};
use crate::types::{Circle, IrisGeometry, NormalizedFrame};
use boundary::{CircleSearch, FULL_CIRCLE};

/// Configuration for [`IrisSegmenter`]. Radii are in canonical-frame pixels.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Gaussian sigma applied before thresholding and boundary search.
    pub blur_sigma: f32,
    /// Share of darkest pixels that seeds the pupil blob.
    pub pupil_dark_percentile: f32,
    /// Structuring-element radius for the morphological cleanup (0 disables).
    pub morph_radius: u8,
    pub min_pupil_radius: f32,
    pub max_pupil_radius: f32,
    /// Maximum blob centroid distance from the frame center, as a fraction of the frame size.
    pub max_pupil_offset: f32,
    /// Minimum blob area over the area of its bounding circle.
    pub min_pupil_circularity: f32,
    /// Minimum short/long side ratio of the blob bounding box.
    pub min_pupil_aspect: f32,
    /// Half-width of the pupil center search grid (pixels).
    pub pupil_center_search: i32,
    /// Half-width of the limbus center search grid around the pupil center (pixels).
    pub iris_center_search: i32,
    pub min_iris_radius: f32,
    pub max_iris_radius: f32,
    /// Accepted pupil/iris radius ratio range.
    pub min_radius_ratio: f32,
    pub max_radius_ratio: f32,
    /// Minimum radial edge strength for a boundary (intensity units).
    pub min_boundary_strength: f32,
    /// Samples per circle in the boundary search.
    pub circle_samples: usize,
    /// Half-angle of the lateral sectors used for the limbus (degrees).
    pub lateral_half_angle_deg: f32,
    /// Minimum mean row edge for an eyelid line (intensity units).
    pub eyelid_edge_threshold: f32,
    /// Horizontal span of the eyelid edge average, as a fraction of the iris radius.
    pub eyelid_column_span: f32,
    /// How far from the iris center the eyelid search reaches, as a fraction of the iris radius.
    pub eyelid_search_reach: f32,
    /// Extra rows masked past a detected eyelid line.
    pub eyelid_margin: u32,
    /// Intensity at or above which band pixels count as reflections.
    pub specular_threshold: f32,
    /// Band pixels within this margin of the pupil darkness count as eyelashes.
    pub eyelash_margin: f32,
    /// Maximum occluded share of the iris band.
    pub max_occluded_fraction: f32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.5,
            pupil_dark_percentile: 0.015,
            morph_radius: 3,
            min_pupil_radius: 10.0,
            max_pupil_radius: 80.0,
            max_pupil_offset: 0.3,
            min_pupil_circularity: 0.55,
            min_pupil_aspect: 0.6,
            pupil_center_search: 4,
            iris_center_search: 6,
            min_iris_radius: 40.0,
            max_iris_radius: 158.0,
            min_radius_ratio: 0.2,
            max_radius_ratio: 0.7,
            min_boundary_strength: 0.03,
            circle_samples: 64,
            lateral_half_angle_deg: 30.0,
            eyelid_edge_threshold: 0.2,
            eyelid_column_span: 0.6,
            eyelid_search_reach: 0.85,
            eyelid_margin: 2,
            specular_threshold: 0.94,
            eyelash_margin: 0.08,
            max_occluded_fraction: 0.6,
        }
    }
}

/// Second pipeline stage: [`NormalizedFrame`] → [`IrisGeometry`].
#[derive(Debug, Clone, Default)]
pub struct IrisSegmenter {
    config: SegmentConfig,
}

impl IrisSegmenter {
    pub fn new(config: SegmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn segment(&self, frame: &NormalizedFrame) -> Result<IrisGeometry> {
        let cfg = &self.config;
        let blurred = blur(frame.image(), cfg.blur_sigma);

        let candidate = pupil::find_candidate(&blurred, cfg)
            .ok_or_else(|| fail("no plausible pupil candidate"))?;

        let pupil_fit = boundary::search(
            &blurred,
            &CircleSearch {
                center: (candidate.x, candidate.y),
                center_radius: cfg.pupil_center_search,
                r_min: (candidate.r * 0.6).max(cfg.min_pupil_radius),
                r_max: (candidate.r * 1.5).min(cfg.max_pupil_radius),
                sectors: FULL_CIRCLE,
                samples: cfg.circle_samples,
            },
        )
        .filter(|f| f.strength >= cfg.min_boundary_strength)
        .ok_or_else(|| fail("pupil boundary not found"))?;
        let pupil = pupil_fit.circle;

        // Radii implied by the accepted dilation range, kept clear of the
        // pupil edge for every shifted center.
        let r_min = (pupil.r / cfg.max_radius_ratio)
            .max(pupil.r * 1.1 + cfg.iris_center_search as f32 + 2.0)
            .max(cfg.min_iris_radius);
        let r_max = (pupil.r / cfg.min_radius_ratio).min(cfg.max_iris_radius);
        let sectors = boundary::lateral_sectors(cfg.lateral_half_angle_deg);
        let iris_fit = boundary::search(
            &blurred,
            &CircleSearch {
                center: (pupil.x, pupil.y),
                center_radius: cfg.iris_center_search,
                r_min,
                r_max,
                sectors: &sectors,
                samples: cfg.circle_samples,
            },
        )
        .filter(|f| f.strength >= cfg.min_boundary_strength)
        .ok_or_else(|| fail("limbus boundary not found"))?;
        let iris = iris_fit.circle;

        self.check_geometry(&pupil, &iris)?;

        let lids = occlusion::find_eyelids(&blurred, &pupil, &iris, cfg);
        let (mask, occluded_fraction) = occlusion::build_mask(frame, &pupil, &iris, lids, cfg);
        if occluded_fraction > cfg.max_occluded_fraction {
            return Err(fail(&format!(
                "iris band {:.0}% occluded (limit {:.0}%)",
                occluded_fraction * 100.0,
                cfg.max_occluded_fraction * 100.0
            )));
        }

        tracing::debug!(
            pupil_x = pupil.x,
            pupil_y = pupil.y,
            pupil_r = pupil.r,
            iris_x = iris.x,
            iris_y = iris.y,
            iris_r = iris.r,
            pupil_edge = pupil_fit.strength,
            iris_edge = iris_fit.strength,
            occluded_fraction,
            "segment: geometry found"
        );

        Ok(IrisGeometry {
            pupil,
            iris,
            occlusion: mask,
            occluded_fraction,
        })
    }

    fn check_geometry(&self, pupil: &Circle, iris: &Circle) -> Result<()> {
        let cfg = &self.config;
        if pupil.r < cfg.min_pupil_radius || pupil.r > cfg.max_pupil_radius {
            return Err(fail(&format!("pupil radius {:.1} out of bounds", pupil.r)));
        }
        if iris.r < cfg.min_iris_radius || iris.r > cfg.max_iris_radius {
            return Err(fail(&format!("iris radius {:.1} out of bounds", iris.r)));
        }
        let ratio = pupil.r / iris.r;
        if ratio < cfg.min_radius_ratio || ratio > cfg.max_radius_ratio {
            return Err(fail(&format!(
                "pupil/iris ratio {ratio:.2} outside [{:.2}, {:.2}]",
                cfg.min_radius_ratio, cfg.max_radius_ratio
            )));
        }
        if iris.distance_to(pupil.x, pupil.y) + pupil.r >= iris.r {
            return Err(fail("pupil not contained in iris"));
        }
        Ok(())
    }
}

fn fail(reason: &str) -> BiometricError {
    tracing::debug!(reason, "segment: failed");
    BiometricError::SegmentationFailed(reason.to_string())
}

fn blur(img: &GrayImage, sigma: f32) -> GrayImage {
    if sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(img, sigma)
    } else {
        img.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ImagePreprocessor;
    use crate::synthetic::SyntheticEye;
    use image::Luma;

    fn frame_of(eye: &SyntheticEye) -> NormalizedFrame {
        ImagePreprocessor::default()
            .normalize(&eye.to_eye_image())
            .unwrap()
    }

    #[test]
    fn test_segments_synthetic_eye() {
        let eye = SyntheticEye::new(3);
        let geometry = IrisSegmenter::default().segment(&frame_of(&eye)).unwrap();

        assert!((geometry.pupil.x - eye.center.0).abs() <= 2.0);
        assert!((geometry.pupil.y - eye.center.1).abs() <= 2.0);
        assert!((geometry.pupil.r - eye.pupil_radius).abs() <= 2.5);
        assert!((geometry.iris.r - eye.iris_radius).abs() <= 3.0);
        assert!(geometry.occluded_fraction < 0.1);
        assert!(geometry.pupil.r < geometry.iris.r);
    }

    #[test]
    fn test_segmentation_is_deterministic() {
        let frame = frame_of(&SyntheticEye::new(11).with_noise(5, 4));
        let segmenter = IrisSegmenter::default();
        let a = segmenter.segment(&frame).unwrap();
        let b = segmenter.segment(&frame).unwrap();
        assert_eq!(a.pupil, b.pupil);
        assert_eq!(a.iris, b.iris);
        assert_eq!(a.occlusion, b.occlusion);
    }

    #[test]
    fn test_eyelid_occlusion_detected() {
        let eye = SyntheticEye::new(5).with_upper_eyelid(SyntheticEye::DEFAULT_CENTER.1 - 50.0);
        let geometry = IrisSegmenter::default().segment(&frame_of(&eye)).unwrap();
        let (cx, cy) = (eye.center.0 as i64, eye.center.1 as i64);
        assert!(geometry.occlusion.is_occluded(cx, cy - 80));
        assert!(!geometry.occlusion.is_occluded(cx, cy + 70));
        assert!(geometry.occluded_fraction > 0.1);
    }

    #[test]
    fn test_flat_frame_fails() {
        let frame = NormalizedFrame::from_gray(GrayImage::from_pixel(320, 320, Luma([128]))).unwrap();
        let err = IrisSegmenter::default().segment(&frame).unwrap_err();
        assert!(matches!(err, BiometricError::SegmentationFailed(_)));
    }

    #[test]
    fn test_radius_ratio_outside_range_fails() {
        // Pupil nearly as large as the iris: ratio 0.85
        let eye = SyntheticEye::new(2).with_radii(68.0, 80.0);
        let err = IrisSegmenter::default().segment(&frame_of(&eye)).unwrap_err();
        assert!(matches!(err, BiometricError::SegmentationFailed(_)));
    }

    #[test]
    fn test_heavy_occlusion_fails() {
        let config = SegmentConfig {
            max_occluded_fraction: 0.05,
            ..Default::default()
        };
        let eye = SyntheticEye::new(5).with_upper_eyelid(SyntheticEye::DEFAULT_CENTER.1 - 45.0);
        let err = IrisSegmenter::new(config).segment(&frame_of(&eye)).unwrap_err();
        assert!(matches!(err, BiometricError::SegmentationFailed(_)));
    }
}
