//! Eyelid, eyelash and reflection masking inside the iris band.

use image::GrayImage;

use super::SegmentConfig;
use crate::types::{Circle, NormalizedFrame, OcclusionMask};

/// Lid boundaries found above and below the pupil (frame rows).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(super) struct Eyelids {
    pub upper: Option<u32>,
    pub lower: Option<u32>,
}

/// Mean signed vertical edge along row `y`, over columns `[x0, x1]`.
///
/// Positive when the rows above are brighter than the rows below.
fn row_edge(img: &GrayImage, y: u32, x0: u32, x1: u32) -> f32 {
    let mut sum = 0.0f32;
    let mut n = 0u32;
    for x in x0..=x1 {
        let above = img.get_pixel(x, y - 2)[0] as f32;
        let below = img.get_pixel(x, y + 2)[0] as f32;
        sum += above - below;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f32 / 255.0
    }
}

/// Locate eyelid lines as the strongest horizontal edge between the iris
/// rim and the pupil, above and below.
pub(super) fn find_eyelids(
    blurred: &GrayImage,
    pupil: &Circle,
    iris: &Circle,
    config: &SegmentConfig,
) -> Eyelids {
    let (w, h) = blurred.dimensions();
    if w < 5 || h < 5 {
        return Eyelids::default();
    }
    let x0 = (iris.x - config.eyelid_column_span * iris.r).max(0.0) as u32;
    let x1 = ((iris.x + config.eyelid_column_span * iris.r) as u32).min(w - 1);
    let y_min = 2i64;
    let y_max = h as i64 - 3;
    let reach = config.eyelid_search_reach * iris.r;

    let best_row = |from: f32, to: f32, sign: f32| -> Option<u32> {
        let start = (from.ceil() as i64).max(y_min);
        let end = (to.floor() as i64).min(y_max);
        let mut best: Option<(u32, f32)> = None;
        for y in start..=end {
            let edge = sign * row_edge(blurred, y as u32, x0, x1);
            if best.map_or(true, |(_, e)| edge > e) {
                best = Some((y as u32, edge));
            }
        }
        best.filter(|&(_, e)| e >= config.eyelid_edge_threshold)
            .map(|(y, _)| y)
    };

    let lids = Eyelids {
        upper: best_row(iris.y - reach, pupil.y - pupil.r - 1.0, 1.0),
        lower: best_row(pupil.y + pupil.r + 1.0, iris.y + reach, -1.0),
    };
    if lids.upper.is_some() || lids.lower.is_some() {
        tracing::debug!(upper = ?lids.upper, lower = ?lids.lower, "segment: eyelids found");
    }
    lids
}

/// Mean intensity inside the pupil, excluding specular pixels.
pub(super) fn pupil_mean(frame: &NormalizedFrame, pupil: &Circle, specular: f32) -> f32 {
    let inner = Circle::new(pupil.x, pupil.y, pupil.r * 0.8);
    let mut sum = 0.0f32;
    let mut n = 0u32;
    for_each_pixel_in(frame, &inner, |x, y| {
        let v = frame.intensity(x, y);
        if v < specular {
            sum += v;
            n += 1;
        }
    });
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

fn for_each_pixel_in(frame: &NormalizedFrame, c: &Circle, mut f: impl FnMut(u32, u32)) {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let x0 = ((c.x - c.r).floor() as i64).max(0);
    let x1 = ((c.x + c.r).ceil() as i64).min(w - 1);
    let y0 = ((c.y - c.r).floor() as i64).max(0);
    let y1 = ((c.y + c.r).ceil() as i64).min(h - 1);
    for y in y0..=y1 {
        for x in x0..=x1 {
            if c.contains(x as f32, y as f32) {
                f(x as u32, y as u32);
            }
        }
    }
}

/// Build the frame-sized occlusion mask and the occluded share of the band.
///
/// Band pixels outside the frame count as occluded.
pub(super) fn build_mask(
    frame: &NormalizedFrame,
    pupil: &Circle,
    iris: &Circle,
    lids: Eyelids,
    config: &SegmentConfig,
) -> (OcclusionMask, f32) {
    let mut mask = OcclusionMask::clear(frame.width(), frame.height());
    let dark_limit = pupil_mean(frame, pupil, config.specular_threshold) + config.eyelash_margin;

    let x0 = (iris.x - iris.r).floor() as i64;
    let x1 = (iris.x + iris.r).ceil() as i64;
    let y0 = (iris.y - iris.r).floor() as i64;
    let y1 = (iris.y + iris.r).ceil() as i64;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let mut band = 0usize;
    let mut occluded = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (xf, yf) = (x as f32, y as f32);
            if pupil.contains(xf, yf) || !iris.contains(xf, yf) {
                continue;
            }
            band += 1;
            if x < 0 || y < 0 || x >= w || y >= h {
                occluded += 1;
                continue;
            }
            let (xu, yu) = (x as u32, y as u32);
            let m = config.eyelid_margin;
            let under_lid =
                lids.upper.is_some_and(|l| yu <= l + m) || lids.lower.is_some_and(|l| yu + m >= l);
            let v = frame.intensity(xu, yu);
            if under_lid || v >= config.specular_threshold || v <= dark_limit {
                mask.set(xu, yu);
                occluded += 1;
            }
        }
    }

    let fraction = if band == 0 {
        1.0
    } else {
        occluded as f32 / band as f32
    };
    (mask, fraction)
}
