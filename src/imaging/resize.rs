//! Aspect-preserving downscaling

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

/// Resampling filter for downscaling (bicubic)
pub const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

/// Output dimensions for fitting `(width, height)` within `max_side`
///
/// Each dimension is scaled by `max_side / longest` and rounded down
/// independently, then clamped to at least one pixel. Integer arithmetic
/// keeps the longest side exactly `max_side`.
pub fn target_dimensions(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side {
        return (width, height);
    }

    let scale = |side: u32| -> u32 {
        let scaled = u64::from(side) * u64::from(max_side) / u64::from(longest);
        (scaled as u32).max(1)
    };

    (scale(width), scale(height))
}

/// Downscale `image` so its longest side is at most `max_side`
///
/// Images that already fit are returned as-is, without resampling. The
/// pixel format is preserved.
pub fn resize_max_side(image: DynamicImage, max_side: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = target_dimensions(width, height, max_side);

    if (new_width, new_height) == (width, height) {
        return image;
    }

    tracing::debug!(
        "Resizing {}x{} to {}x{} (max side {})",
        width,
        height,
        new_width,
        new_height,
        max_side
    );
    image.resize_exact(new_width, new_height, RESIZE_FILTER)
}
