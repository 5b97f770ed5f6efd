//! One-dimensional complex Gabor filters with circular wrap.

use std::f32::consts::TAU;

/// Sampled even (cosine) and odd (sine) parts of a complex Gabor filter.
///
/// The even part has its DC term removed so a flat row yields a zero real
/// response. Both parts are scaled by the envelope sum, so responses are in
/// the intensity units of the input row.
#[derive(Debug, Clone)]
pub(super) struct GaborKernel {
    even: Vec<f32>,
    odd: Vec<f32>,
    half: usize,
}

impl GaborKernel {
    pub fn new(wavelength: f32, sigma_ratio: f32) -> Self {
        let sigma = (sigma_ratio * wavelength).max(0.5);
        let half = (3.0 * sigma).ceil() as usize;
        let offsets = || (0..=2 * half).map(|i| i as f32 - half as f32);

        let envelope: Vec<f32> = offsets()
            .map(|n| (-(n * n) / (2.0 * sigma * sigma)).exp())
            .collect();
        let norm: f32 = envelope.iter().sum();

        let mut even: Vec<f32> = offsets()
            .zip(&envelope)
            .map(|(n, g)| g * (TAU * n / wavelength).cos())
            .collect();
        let odd: Vec<f32> = offsets()
            .zip(&envelope)
            .map(|(n, g)| g * (TAU * n / wavelength).sin() / norm)
            .collect();

        let dc = even.iter().sum::<f32>() / norm;
        for (e, g) in even.iter_mut().zip(&envelope) {
            *e = (*e - dc * g) / norm;
        }

        Self { even, odd, half }
    }

    /// Complex response centered on `col`, wrapping around the row ends.
    pub fn respond(&self, row: &[f32], col: usize) -> (f32, f32) {
        let len = row.len();
        let mut re = 0.0f32;
        let mut im = 0.0f32;
        for (k, (e, o)) in self.even.iter().zip(&self.odd).enumerate() {
            let idx = (col + len * (self.half / len + 1) + k - self.half) % len;
            let v = row[idx];
            re += e * v;
            im += o * v;
        }
        (re, im)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_row_has_no_response() {
        let kernel = GaborKernel::new(16.0, 0.5);
        let row = vec![0.7f32; 256];
        let (re, im) = kernel.respond(&row, 37);
        assert!(re.abs() < 1e-5, "re {re}");
        assert!(im.abs() < 1e-5, "im {im}");
    }

    #[test]
    fn test_matched_sinusoid_responds_strongly() {
        let kernel = GaborKernel::new(16.0, 0.5);
        let row: Vec<f32> = (0..256)
            .map(|j| (TAU * j as f32 / 16.0).cos() * 0.1)
            .collect();
        let (re, im) = kernel.respond(&row, 0);
        // Cosine peak at column 0: real part positive, imaginary near zero
        assert!(re > 0.03, "re {re}");
        assert!(im.abs() < 0.01, "im {im}");
    }

    #[test]
    fn test_wraps_circularly() {
        let kernel = GaborKernel::new(8.0, 0.5);
        let row: Vec<f32> = (0..256).map(|j| ((j * 7) % 13) as f32 / 13.0).collect();
        let mut rotated = row.clone();
        rotated.rotate_left(3);
        let a = kernel.respond(&row, 3);
        let b = kernel.respond(&rotated, 0);
        assert!((a.0 - b.0).abs() < 1e-5);
        assert!((a.1 - b.1).abs() < 1e-5);
    }
}
