//! Pupil candidate extraction: dark-percentile threshold, morphological
//! cleanup and connected-component selection.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::SegmentConfig;

/// Coarse pupil estimate from blob analysis. Refined later by the circle search.
#[derive(Debug, Clone, Copy)]
pub(super) struct PupilCandidate {
    pub x: f32,
    pub y: f32,
    /// Radius of the disk with the same area as the blob.
    pub r: f32,
    pub area: u32,
}

#[derive(Debug, Clone, Copy)]
struct BlobStats {
    area: u32,
    sum_x: u64,
    sum_y: u64,
    min_x: u32,
    max_x: u32,
    min_y: u32,
    max_y: u32,
}

impl BlobStats {
    fn new() -> Self {
        Self {
            area: 0,
            sum_x: 0,
            sum_y: 0,
            min_x: u32::MAX,
            max_x: 0,
            min_y: u32::MAX,
            max_y: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }
}

/// Find the largest dark, round blob near the frame center.
pub(super) fn find_candidate(blurred: &GrayImage, config: &SegmentConfig) -> Option<PupilCandidate> {
    let (w, h) = blurred.dimensions();
    let threshold = dark_threshold(blurred, config.pupil_dark_percentile);

    let mut binary = GrayImage::new(w, h);
    for (x, y, p) in blurred.enumerate_pixels() {
        if p[0] <= threshold {
            binary.put_pixel(x, y, Luma([255]));
        }
    }

    // Close fills specular holes, open removes eyelash strands.
    let k = config.morph_radius;
    let cleaned = if k > 0 {
        let closed = imageproc::morphology::close(&binary, Norm::LInf, k);
        imageproc::morphology::open(&closed, Norm::LInf, k)
    } else {
        binary
    };

    let labels = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));
    let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if max_label == 0 {
        return None;
    }

    let mut stats = vec![BlobStats::new(); max_label + 1];
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p[0] as usize;
        if label != 0 {
            stats[label].add(x, y);
        }
    }

    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    let max_offset = config.max_pupil_offset * w.min(h) as f32;

    let mut best: Option<PupilCandidate> = None;
    for s in stats.iter().skip(1).filter(|s| s.area > 0) {
        let r = (s.area as f32 / std::f32::consts::PI).sqrt();
        if r < config.min_pupil_radius || r > config.max_pupil_radius {
            continue;
        }
        let x = s.sum_x as f32 / s.area as f32;
        let y = s.sum_y as f32 / s.area as f32;
        if ((x - cx).powi(2) + (y - cy).powi(2)).sqrt() > max_offset {
            continue;
        }
        let bw = (s.max_x - s.min_x + 1) as f32;
        let bh = (s.max_y - s.min_y + 1) as f32;
        let aspect = bw.min(bh) / bw.max(bh);
        let half = bw.max(bh) / 2.0;
        let circularity = s.area as f32 / (std::f32::consts::PI * half * half);
        if aspect < config.min_pupil_aspect || circularity < config.min_pupil_circularity {
            continue;
        }
        if best.map_or(true, |b| s.area > b.area) {
            best = Some(PupilCandidate {
                x,
                y,
                r,
                area: s.area,
            });
        }
    }

    if let Some(c) = best {
        tracing::debug!(
            x = c.x,
            y = c.y,
            r = c.r,
            area = c.area,
            threshold,
            "segment: pupil candidate"
        );
    }
    best
}

/// Intensity at the requested dark percentile.
fn dark_threshold(img: &GrayImage, percentile: f32) -> u8 {
    let mut hist = [0u64; 256];
    for p in img.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total = img.width() as u64 * img.height() as u64;
    let target = ((percentile.clamp(0.0, 1.0) as f64) * total as f64).ceil().max(1.0) as u64;
    let mut acc = 0u64;
    for (v, &count) in hist.iter().enumerate() {
        acc += count;
        if acc >= target {
            return v as u8;
        }
    }
    255
}
