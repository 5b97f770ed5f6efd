//! Exhaustive integro-differential circle search.
//!
//! For every candidate center on an integer grid and every radius in the
//! range, the mean intensity along the circle is sampled; the boundary is the
//! (center, radius) with the largest positive radial derivative of that mean.

use std::f32::consts::{PI, TAU};

use image::GrayImage;

use crate::types::{bilinear_sample, Circle};

/// Angular sector `[start, end)` in radians.
pub(super) type Sector = (f32, f32);

pub(super) const FULL_CIRCLE: &[Sector] = &[(0.0, TAU)];

/// Search window for one boundary.
#[derive(Debug, Clone)]
pub(super) struct CircleSearch<'a> {
    pub center: (f32, f32),
    /// Half-width of the center grid (pixels).
    pub center_radius: i32,
    pub r_min: f32,
    pub r_max: f32,
    pub sectors: &'a [Sector],
    /// Samples per circle across all sectors.
    pub samples: usize,
}

/// Best boundary found and its edge strength (intensity units per 2 px).
#[derive(Debug, Clone, Copy)]
pub(super) struct BoundaryFit {
    pub circle: Circle,
    pub strength: f32,
}

/// Left/right sectors of `half_angle_deg` around the horizontal axis.
pub(super) fn lateral_sectors(half_angle_deg: f32) -> [Sector; 2] {
    let a = half_angle_deg.to_radians();
    [(-a, a), (PI - a, PI + a)]
}

fn sample_angles(sectors: &[Sector], samples: usize) -> Vec<f32> {
    let per_sector = (samples / sectors.len().max(1)).max(1);
    let mut angles = Vec::with_capacity(per_sector * sectors.len());
    for &(start, end) in sectors {
        let step = (end - start) / per_sector as f32;
        for i in 0..per_sector {
            angles.push(start + (i as f32 + 0.5) * step);
        }
    }
    angles
}

/// Mean intensity along a circle, or `None` when fewer than half the samples
/// fall inside the image.
fn circular_mean(img: &GrayImage, cx: f32, cy: f32, r: f32, trig: &[(f32, f32)]) -> Option<f32> {
    let mut sum = 0.0f32;
    let mut n = 0usize;
    for &(c, s) in trig {
        if let Some(v) = bilinear_sample(img, cx + r * c, cy + r * s) {
            sum += v;
            n += 1;
        }
    }
    if n * 2 < trig.len() {
        None
    } else {
        Some(sum / n as f32)
    }
}

/// Run the search. Returns `None` when the radius range is empty or no
/// circle could be sampled.
pub(super) fn search(img: &GrayImage, search: &CircleSearch<'_>) -> Option<BoundaryFit> {
    let r_lo = search.r_min.ceil() as i32;
    let r_hi = search.r_max.floor() as i32;
    if r_hi < r_lo || r_lo < 2 {
        return None;
    }

    let trig: Vec<(f32, f32)> = sample_angles(search.sectors, search.samples)
        .into_iter()
        .map(|t| (t.cos(), t.sin()))
        .collect();

    let n_r = (r_hi - r_lo + 3) as usize;
    let mut means = vec![None; n_r];
    let mut best: Option<BoundaryFit> = None;

    let k = search.center_radius.max(0);
    for dy in -k..=k {
        for dx in -k..=k {
            let cx = search.center.0.round() + dx as f32;
            let cy = search.center.1.round() + dy as f32;

            // means[i] holds radius r_lo - 1 + i
            for (i, m) in means.iter_mut().enumerate() {
                let r = (r_lo - 1 + i as i32) as f32;
                *m = circular_mean(img, cx, cy, r, &trig);
            }

            for i in 1..n_r - 1 {
                let (Some(inner), Some(outer)) = (means[i - 1], means[i + 1]) else {
                    continue;
                };
                let strength = outer - inner;
                if best.map_or(true, |b| strength > b.strength) {
                    best = Some(BoundaryFit {
                        circle: Circle::new(cx, cy, (r_lo - 1 + i as i32) as f32),
                        strength,
                    });
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_disk_image;

    #[test]
    fn test_recovers_disk_boundary() {
        let img = draw_disk_image(200, 200, [103.0, 97.0], 40.0, 20, 180);
        let fit = search(
            &img,
            &CircleSearch {
                center: (100.0, 100.0),
                center_radius: 5,
                r_min: 25.0,
                r_max: 60.0,
                sectors: FULL_CIRCLE,
                samples: 64,
            },
        )
        .unwrap();
        assert_eq!(fit.circle.x, 103.0);
        assert_eq!(fit.circle.y, 97.0);
        assert!((fit.circle.r - 40.0).abs() <= 1.0);
        assert!(fit.strength > 0.3);
    }

    #[test]
    fn test_lateral_sectors_ignore_top_and_bottom() {
        let img = draw_disk_image(200, 200, [100.0, 100.0], 50.0, 60, 200);
        let sectors = lateral_sectors(30.0);
        let fit = search(
            &img,
            &CircleSearch {
                center: (100.0, 100.0),
                center_radius: 0,
                r_min: 30.0,
                r_max: 80.0,
                sectors: &sectors,
                samples: 64,
            },
        )
        .unwrap();
        assert!((fit.circle.r - 50.0).abs() <= 1.0);
    }

    #[test]
    fn test_empty_range() {
        let img = draw_disk_image(50, 50, [25.0, 25.0], 10.0, 0, 255);
        let s = CircleSearch {
            center: (25.0, 25.0),
            center_radius: 1,
            r_min: 20.0,
            r_max: 10.0,
            sectors: FULL_CIRCLE,
            samples: 16,
        };
        assert!(search(&img, &s).is_none());
    }
}
