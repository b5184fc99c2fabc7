//! Detection rendering

use image::{DynamicImage, Rgba, RgbaImage};

use crate::inference::detector::Detections;

/// Outline thickness in pixels
const BOX_THICKNESS: i32 = 2;

const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 194, 255],
];

/// Stable colour for a class id
pub fn class_color(class_id: u32) -> Rgba<u8> {
    let [r, g, b] = PALETTE[class_id as usize % PALETTE.len()];
    Rgba([r, g, b, 255])
}

/// Draw every detection's box onto an RGBA copy of `image`
pub fn draw_detections(image: &DynamicImage, detections: &Detections) -> RgbaImage {
    let mut canvas = image.to_rgba8();

    for detection in &detections.detections {
        let [x0, y0, x1, y1] = detection.bbox_xyxy;
        let color = class_color(detection.class_id);
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut canvas,
                x0.round() as i32 + inset,
                y0.round() as i32 + inset,
                x1.round() as i32 - inset,
                y1.round() as i32 - inset,
                color,
            );
        }
    }

    canvas
}

fn draw_rectangle(image: &mut RgbaImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || left > right || top > bottom {
        return;
    }
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }

    let x_range = left.max(0)..=right.min(width - 1);
    let y_range = top.max(0)..=bottom.min(height - 1);

    for x in x_range.clone() {
        if (0..height).contains(&top) {
            image.put_pixel(x as u32, top as u32, color);
        }
        if (0..height).contains(&bottom) {
            image.put_pixel(x as u32, bottom as u32, color);
        }
    }
    for y in y_range {
        if (0..width).contains(&left) {
            image.put_pixel(left as u32, y as u32, color);
        }
        if (0..width).contains(&right) {
            image.put_pixel(right as u32, y as u32, color);
        }
    }
}
