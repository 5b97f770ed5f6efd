//! Rubber-sheet unwrapping of the iris band.

use std::f32::consts::TAU;

use crate::types::{IrisGeometry, NormalizedFrame, UnwrappedIris, UNWRAP_COLS, UNWRAP_ROWS};

/// Sample the band between the pupil and limbus circles onto a fixed
/// `UNWRAP_ROWS` × `UNWRAP_COLS` grid.
///
/// Row `i` sits at normalized radius `(i + 0.5) / UNWRAP_ROWS` on the segment
/// joining the two circles at the column's angle, so non-concentric
/// boundaries are handled. Texels outside the frame or under the occlusion
/// mask are marked occluded and hold zero.
pub(super) fn unwrap(frame: &NormalizedFrame, geometry: &IrisGeometry) -> UnwrappedIris {
    let mut texture = vec![0.0f32; UNWRAP_ROWS * UNWRAP_COLS];
    let mut occluded = vec![true; UNWRAP_ROWS * UNWRAP_COLS];

    for j in 0..UNWRAP_COLS {
        let theta = TAU * j as f32 / UNWRAP_COLS as f32;
        let (px, py) = geometry.pupil.point_at(theta);
        let (ix, iy) = geometry.iris.point_at(theta);
        for i in 0..UNWRAP_ROWS {
            let rho = (i as f32 + 0.5) / UNWRAP_ROWS as f32;
            let x = px + rho * (ix - px);
            let y = py + rho * (iy - py);
            let idx = i * UNWRAP_COLS + j;
            if geometry
                .occlusion
                .is_occluded(x.round() as i64, y.round() as i64)
            {
                continue;
            }
            if let Some(v) = frame.sample(x, y) {
                texture[idx] = v;
                occluded[idx] = false;
            }
        }
    }

    // Lengths are fixed by construction.
    UnwrappedIris::from_parts(texture, occluded)
}
