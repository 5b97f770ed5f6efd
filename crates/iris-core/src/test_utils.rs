use image::{GrayImage, Luma};

/// Filled disk on a uniform background. Pixel centers within `r` of
/// `center` take `inside`.
pub(crate) fn draw_disk_image(
    width: u32,
    height: u32,
    center: [f32; 2],
    r: f32,
    inside: u8,
    outside: u8,
) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - center[0];
        let dy = y as f32 - center[1];
        if (dx * dx + dy * dy).sqrt() <= r {
            Luma([inside])
        } else {
            Luma([outside])
        }
    })
}
