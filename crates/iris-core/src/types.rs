use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::GrayImage;

use crate::error::{BiometricError, Result};

/// Largest accepted side of an input image, in pixels.
pub const MAX_INPUT_DIMENSION: u32 = 1024;

/// Side length of the canonical square frame every stage works in.
pub const CANONICAL_SIZE: u32 = 320;

/// Radial resolution of the unwrapped iris (pupil boundary → limbus).
pub const UNWRAP_ROWS: usize = 64;
/// Angular resolution of the unwrapped iris.
pub const UNWRAP_COLS: usize = 256;

/// Template rows; each samples one radial band of the unwrapped texture.
pub const TEMPLATE_ROWS: usize = 16;
/// Template columns, one per angular texel.
pub const TEMPLATE_COLS: usize = UNWRAP_COLS;
/// Bits per template cell: two filters, sign of real and imaginary part.
pub const CELL_BITS: usize = 4;
/// Bits in one template row.
pub const ROW_BITS: usize = TEMPLATE_COLS * CELL_BITS;
/// Total template length in bits. Process-wide constant.
pub const TEMPLATE_BITS: usize = TEMPLATE_ROWS * ROW_BITS;
/// Template length in 64-bit words.
pub const TEMPLATE_WORDS: usize = TEMPLATE_BITS / 64;

// ── Input image ───────────────────────────────────────────────────────────────

/// Raw eye-patch image handed over by the client.
///
/// Pixels are interleaved, row-major, 8 bits per channel. Supported channel
/// counts are 1 (gray), 3 (RGB) and 4 (RGBA). Buffer length is validated by
/// the preprocessor, not here, so malformed input surfaces as `InvalidImage`
/// at the first stage.
#[derive(Debug, Clone)]
pub struct EyeImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    captured_at: DateTime<Utc>,
}

impl EyeImage {
    pub fn from_raw(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            captured_at: Utc::now(),
        }
    }

    /// Decode a PNG or JPEG eye patch no larger than [`MAX_INPUT_DIMENSION`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_with_limit(bytes, MAX_INPUT_DIMENSION)
    }

    /// Decode an eye patch, rejecting it from the header alone when either
    /// side exceeds `max_dimension`.
    pub fn decode_with_limit(bytes: &[u8], max_dimension: u32) -> Result<Self> {
        let (width, height) = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(decode_failed)?
            .into_dimensions()
            .map_err(decode_failed)?;
        if width > max_dimension || height > max_dimension {
            return Err(BiometricError::InvalidImage(format!(
                "{width}x{height} exceeds maximum dimension {max_dimension}"
            )));
        }
        let img = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(decode_failed)?
            .decode()
            .map_err(decode_failed)?;
        let (width, height) = (img.width(), img.height());
        let (data, channels) = match img.color().channel_count() {
            1 | 2 => (img.to_luma8().into_raw(), 1),
            3 => (img.to_rgb8().into_raw(), 3),
            _ => (img.to_rgba8().into_raw(), 4),
        };
        Ok(Self::from_raw(data, width, height, channels))
    }

    pub fn with_capture_time(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

fn decode_failed(e: impl std::fmt::Display) -> BiometricError {
    BiometricError::InvalidImage(format!("decode failed: {e}"))
}

// ── Canonical frame ───────────────────────────────────────────────────────────

/// Grayscale, contrast-normalized frame at [`CANONICAL_SIZE`].
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    gray: GrayImage,
}

impl NormalizedFrame {
    pub fn from_gray(gray: GrayImage) -> Result<Self> {
        if gray.dimensions() != (CANONICAL_SIZE, CANONICAL_SIZE) {
            return Err(BiometricError::InvalidImage(format!(
                "frame must be {CANONICAL_SIZE}x{CANONICAL_SIZE}, got {}x{}",
                gray.width(),
                gray.height()
            )));
        }
        Ok(Self { gray })
    }

    pub fn image(&self) -> &GrayImage {
        &self.gray
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    /// Intensity at an integer pixel in [0, 1].
    #[inline]
    pub fn intensity(&self, x: u32, y: u32) -> f32 {
        self.gray.get_pixel(x, y)[0] as f32 / 255.0
    }

    /// Bilinear sample in [0, 1], or `None` outside the frame.
    #[inline]
    pub fn sample(&self, x: f32, y: f32) -> Option<f32> {
        bilinear_sample(&self.gray, x, y)
    }
}

/// Sample a grayscale image at a sub-pixel position.
/// Returns intensity in [0, 1], or `None` if the 2x2 neighbourhood is out of bounds.
#[inline]
pub(crate) fn bilinear_sample(img: &GrayImage, x: f32, y: f32) -> Option<f32> {
    let (w, h) = img.dimensions();
    if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let p = |xx: u32, yy: u32| img.get_pixel(xx, yy)[0] as f32;
    let top = p(x0, y0) * (1.0 - fx) + p(x0 + 1, y0) * fx;
    let bottom = p(x0, y0 + 1) * (1.0 - fx) + p(x0 + 1, y0 + 1) * fx;
    Some((top * (1.0 - fy) + bottom * fy) / 255.0)
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Circle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub r: f32,
}

impl Circle {
    pub fn new(x: f32, y: f32, r: f32) -> Self {
        Self { x, y, r }
    }

    /// Point on the circle at angle `theta` (radians, image y axis pointing down).
    #[inline]
    pub fn point_at(&self, theta: f32) -> (f32, f32) {
        (self.x + self.r * theta.cos(), self.y + self.r * theta.sin())
    }

    #[inline]
    pub fn distance_to(&self, x: f32, y: f32) -> f32 {
        ((x - self.x).powi(2) + (y - self.y).powi(2)).sqrt()
    }

    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.distance_to(x, y) <= self.r
    }
}

/// Frame-sized occlusion grid (eyelids, eyelashes, reflections).
#[derive(Debug, Clone, PartialEq)]
pub struct OcclusionMask {
    width: u32,
    height: u32,
    occluded: Vec<bool>,
}

impl OcclusionMask {
    pub fn clear(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            occluded: vec![false; (width * height) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixels outside the frame count as occluded.
    #[inline]
    pub fn is_occluded(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return true;
        }
        self.occluded[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32) {
        if x < self.width && y < self.height {
            self.occluded[y as usize * self.width as usize + x as usize] = true;
        }
    }
}

/// Pupil and limbus boundaries plus the occlusion mask of one frame.
#[derive(Debug, Clone)]
pub struct IrisGeometry {
    pub pupil: Circle,
    pub iris: Circle,
    pub occlusion: OcclusionMask,
    /// Fraction of iris-band pixels marked occluded.
    pub occluded_fraction: f32,
}

impl IrisGeometry {
    /// Pupil-to-iris radius ratio.
    pub fn dilation(&self) -> f32 {
        self.pupil.r / self.iris.r
    }

    /// Whether a pixel lies in the annulus between pupil and limbus.
    #[inline]
    pub fn in_band(&self, x: f32, y: f32) -> bool {
        !self.pupil.contains(x, y) && self.iris.contains(x, y)
    }
}

// ── Unwrapped texture ─────────────────────────────────────────────────────────

/// Polar-unwrapped iris texture, [`UNWRAP_ROWS`] × [`UNWRAP_COLS`].
///
/// Row 0 lies on the pupil boundary, the last row on the limbus. Column `j`
/// corresponds to angle `2πj / UNWRAP_COLS`.
#[derive(Debug, Clone)]
pub struct UnwrappedIris {
    texture: Vec<f32>,
    occluded: Vec<bool>,
}

impl UnwrappedIris {
    /// Caller guarantees both buffers hold `UNWRAP_ROWS * UNWRAP_COLS` texels.
    pub(crate) fn from_parts(texture: Vec<f32>, occluded: Vec<bool>) -> Self {
        debug_assert_eq!(texture.len(), UNWRAP_ROWS * UNWRAP_COLS);
        debug_assert_eq!(occluded.len(), UNWRAP_ROWS * UNWRAP_COLS);
        Self { texture, occluded }
    }

    #[inline]
    pub fn texel(&self, row: usize, col: usize) -> f32 {
        self.texture[row * UNWRAP_COLS + col]
    }

    #[inline]
    pub fn is_occluded(&self, row: usize, col: usize) -> bool {
        self.occluded[row * UNWRAP_COLS + col]
    }

    pub fn valid_fraction(&self) -> f32 {
        let valid = self.occluded.iter().filter(|&&o| !o).count();
        valid as f32 / self.occluded.len() as f32
    }
}

// ── Template ──────────────────────────────────────────────────────────────────

/// Binary iris code with its validity mask.
///
/// Bit `i` of the code is meaningful only where bit `i` of the mask is set.
/// Cells are laid out row-major; bit index of (row, col, k) is
/// `row * ROW_BITS + col * CELL_BITS + k`, so a circular shift along the
/// angular axis is a rotation of each row by whole cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    code: Vec<u64>,
    mask: Vec<u64>,
}

impl Template {
    /// Build a template from packed code and mask words.
    pub fn from_words(code: Vec<u64>, mask: Vec<u64>) -> Result<Self> {
        if code.len() != TEMPLATE_WORDS || mask.len() != TEMPLATE_WORDS {
            return Err(BiometricError::InvalidTemplate(format!(
                "expected {TEMPLATE_WORDS} words, got code {} / mask {}",
                code.len(),
                mask.len()
            )));
        }
        Ok(Self { code, mask })
    }

    /// Build a template bit by bit. `f(index)` returns `(code_bit, valid)`.
    pub fn from_fn(mut f: impl FnMut(usize) -> (bool, bool)) -> Self {
        let mut code = vec![0u64; TEMPLATE_WORDS];
        let mut mask = vec![0u64; TEMPLATE_WORDS];
        for idx in 0..TEMPLATE_BITS {
            let (bit, valid) = f(idx);
            let (w, b) = (idx / 64, idx % 64);
            if bit {
                code[w] |= 1 << b;
            }
            if valid {
                mask[w] |= 1 << b;
            }
        }
        Self { code, mask }
    }

    #[inline]
    pub fn bit_index(row: usize, col: usize, k: usize) -> usize {
        row * ROW_BITS + col * CELL_BITS + k
    }

    #[inline]
    pub fn bit(&self, idx: usize) -> bool {
        self.code[idx / 64] >> (idx % 64) & 1 == 1
    }

    #[inline]
    pub fn is_valid(&self, idx: usize) -> bool {
        self.mask[idx / 64] >> (idx % 64) & 1 == 1
    }

    pub fn code_words(&self) -> &[u64] {
        &self.code
    }

    pub fn mask_words(&self) -> &[u64] {
        &self.mask
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn valid_fraction(&self) -> f32 {
        self.valid_count() as f32 / TEMPLATE_BITS as f32
    }

    /// Circularly shift every row by `shift` cells along the angular axis.
    ///
    /// Cell `c` of the result holds cell `c - shift` of `self`.
    pub fn rotated(&self, shift: i32) -> Template {
        let cols = TEMPLATE_COLS as i32;
        let s = shift.rem_euclid(cols) as usize;
        if s == 0 {
            return self.clone();
        }
        Template::from_fn(|idx| {
            let row = idx / ROW_BITS;
            let col = (idx % ROW_BITS) / CELL_BITS;
            let k = idx % CELL_BITS;
            let src_col = (col + TEMPLATE_COLS - s) % TEMPLATE_COLS;
            let src = Template::bit_index(row, src_col, k);
            (self.bit(src), self.is_valid(src))
        })
    }
}
