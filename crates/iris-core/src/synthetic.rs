//! Deterministic synthetic eye renderer.
//!
//! Produces a square gray eye patch with a dark pupil, a textured iris band,
//! bright sclera, optional upper eyelid and corneal highlights. The iris
//! texture is a smooth value-noise field seeded per identity, so two renders
//! with the same seed are the same eye and different seeds are unrelated eyes.
//! Rotation turns the texture only; highlights and eyelid stay put, as they
//! would for a real head tilt under a fixed illuminator.

use std::f32::consts::TAU;

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{EyeImage, CANONICAL_SIZE};

const ANGULAR_CELLS: usize = 48;
const RADIAL_CELLS: usize = 6;

/// Corneal reflection, relative to the pupil center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Highlight {
    pub dx: f32,
    pub dy: f32,
    pub r: f32,
    pub value: u8,
}

#[derive(Debug, Clone)]
pub struct SyntheticEye {
    pub seed: u64,
    pub size: u32,
    pub center: (f32, f32),
    pub pupil_radius: f32,
    pub iris_radius: f32,
    pub pupil_value: u8,
    pub sclera_value: u8,
    pub skin_value: u8,
    /// Rows above this line are covered by skin.
    pub upper_eyelid: Option<f32>,
    pub highlights: Vec<Highlight>,
    /// `(seed, amplitude)` of uniform additive sensor noise.
    pub noise: Option<(u64, u8)>,
    /// Texture rotation in radians.
    pub rotation: f32,
}

impl SyntheticEye {
    pub const DEFAULT_CENTER: (f32, f32) = (160.0, 160.0);

    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            size: CANONICAL_SIZE,
            center: Self::DEFAULT_CENTER,
            pupil_radius: 35.0,
            iris_radius: 100.0,
            pupil_value: 15,
            sclera_value: 220,
            skin_value: 190,
            upper_eyelid: None,
            highlights: vec![
                Highlight {
                    dx: -9.0,
                    dy: -9.0,
                    r: 3.0,
                    value: 255,
                },
                Highlight {
                    dx: 7.0,
                    dy: -11.0,
                    r: 2.5,
                    value: 255,
                },
            ],
            noise: None,
            rotation: 0.0,
        }
    }

    pub fn with_radii(mut self, pupil: f32, iris: f32) -> Self {
        self.pupil_radius = pupil;
        self.iris_radius = iris;
        self
    }

    pub fn with_center(mut self, x: f32, y: f32) -> Self {
        self.center = (x, y);
        self
    }

    pub fn with_upper_eyelid(mut self, y: f32) -> Self {
        self.upper_eyelid = Some(y);
        self
    }

    pub fn with_noise(mut self, seed: u64, amplitude: u8) -> Self {
        self.noise = Some((seed, amplitude));
        self
    }

    /// Rotate the iris texture by `columns` template columns.
    pub fn rotated_columns(mut self, columns: i32) -> Self {
        self.rotation = columns as f32 * TAU / crate::types::TEMPLATE_COLS as f32;
        self
    }

    /// Drop all corneal reflections, as on a matte print.
    pub fn without_highlights(mut self) -> Self {
        self.highlights.clear();
        self
    }

    pub fn with_highlights(mut self, highlights: Vec<Highlight>) -> Self {
        self.highlights = highlights;
        self
    }

    pub fn render_gray(&self) -> GrayImage {
        let texture = TextureField::new(self.seed);
        let (cx, cy) = self.center;
        let band = (self.iris_radius - self.pupil_radius).max(1.0);

        let mut img = GrayImage::from_fn(self.size, self.size, |x, y| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let d = (dx * dx + dy * dy).sqrt();
            let v = if d <= self.pupil_radius {
                self.pupil_value as f32
            } else if d <= self.iris_radius {
                let rho = (d - self.pupil_radius) / band;
                let theta = dy.atan2(dx) + self.rotation;
                texture.value(theta, rho)
            } else {
                self.sclera_value as f32
            };
            Luma([v.round().clamp(0.0, 255.0) as u8])
        });

        for h in &self.highlights {
            let (hx, hy) = (cx + h.dx, cy + h.dy);
            for (x, y, p) in img.enumerate_pixels_mut() {
                let d = ((x as f32 - hx).powi(2) + (y as f32 - hy).powi(2)).sqrt();
                if d <= h.r {
                    *p = Luma([h.value]);
                }
            }
        }

        if let Some(lid) = self.upper_eyelid {
            for (_, y, p) in img.enumerate_pixels_mut() {
                if (y as f32) < lid {
                    *p = Luma([self.skin_value]);
                }
            }
        }

        if let Some((seed, amplitude)) = self.noise {
            let mut rng = StdRng::seed_from_u64(seed);
            let a = amplitude as i16;
            for p in img.pixels_mut() {
                let n: i16 = rng.gen_range(-a..=a);
                p[0] = (p[0] as i16 + n).clamp(0, 255) as u8;
            }
        }

        img
    }

    pub fn to_eye_image(&self) -> EyeImage {
        let img = self.render_gray();
        let (w, h) = img.dimensions();
        EyeImage::from_raw(img.into_raw(), w, h, 1)
    }
}

/// Periodic-in-angle value noise over the unit iris band.
struct TextureField {
    nodes: Vec<f32>,
}

impl TextureField {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let nodes = (0..ANGULAR_CELLS * (RADIAL_CELLS + 1))
            .map(|_| rng.gen_range(90.0f32..170.0))
            .collect();
        Self { nodes }
    }

    fn node(&self, a: usize, r: usize) -> f32 {
        self.nodes[r * ANGULAR_CELLS + a % ANGULAR_CELLS]
    }

    fn value(&self, theta: f32, rho: f32) -> f32 {
        let u = theta.rem_euclid(TAU) / TAU * ANGULAR_CELLS as f32;
        let v = rho.clamp(0.0, 1.0) * RADIAL_CELLS as f32;
        let a0 = (u.floor() as usize) % ANGULAR_CELLS;
        let r0 = (v.floor() as usize).min(RADIAL_CELLS - 1);
        let fu = u - u.floor();
        let fv = v - r0 as f32;
        let top = self.node(a0, r0) * (1.0 - fu) + self.node(a0 + 1, r0) * fu;
        let bottom = self.node(a0, r0 + 1) * (1.0 - fu) + self.node(a0 + 1, r0 + 1) * fu;
        top * (1.0 - fv) + bottom * fv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_deterministic() {
        let a = SyntheticEye::new(7).with_noise(1, 6).render_gray();
        let b = SyntheticEye::new(7).with_noise(1, 6).render_gray();
        assert_eq!(a, b);
    }

    #[test]
    fn test_regions_have_expected_levels() {
        let eye = SyntheticEye::new(1);
        let img = eye.render_gray();
        assert_eq!(img.get_pixel(160, 180)[0], 15);
        assert_eq!(img.get_pixel(10, 10)[0], 220);
        let band = img.get_pixel(230, 160)[0];
        assert!((90..=170).contains(&band));
        assert_eq!(img.get_pixel(151, 151)[0], 255);
    }

    #[test]
    fn test_seeds_produce_different_textures() {
        let a = SyntheticEye::new(1).render_gray();
        let b = SyntheticEye::new(2).render_gray();
        let differing = a.pixels().zip(b.pixels()).filter(|(p, q)| p != q).count();
        assert!(differing > 10_000);
    }

    #[test]
    fn test_eyelid_covers_rows_above_line() {
        let img = SyntheticEye::new(1).with_upper_eyelid(100.0).render_gray();
        assert_eq!(img.get_pixel(160, 99)[0], 190);
        assert_ne!(img.get_pixel(160, 100)[0], 190);
    }
}
