//! Synthetic scanned-sheet rasters: dark strokes on white paper.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use parcelmap::GeoTransform;

pub const INK: Rgb<u8> = Rgb([20, 20, 20]);
pub const PAPER: Rgb<u8> = Rgb([255, 255, 255]);

pub fn blank_sheet(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, PAPER)
}

/// Paint every pixel whose centre lies within `radius` of the segment.
pub fn draw_stroke(img: &mut RgbImage, from: (f32, f32), to: (f32, f32), radius: f32, color: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let ((x0, y0), (x1, y1)) = (from, to);
    let r2 = radius * radius;

    let min_x = ((x0.min(x1) - radius).floor() as i32).clamp(0, w - 1);
    let max_x = ((x0.max(x1) + radius).ceil() as i32).clamp(0, w - 1);
    let min_y = ((y0.min(y1) - radius).floor() as i32).clamp(0, h - 1);
    let max_y = ((y0.max(y1) + radius).ceil() as i32).clamp(0, h - 1);

    let (dx, dy) = (x1 - x0, y1 - y0);
    let denom = dx * dx + dy * dy + 1e-12;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let t = (((px - x0) * dx + (py - y0) * dy) / denom).clamp(0.0, 1.0);
            let (cx, cy) = (x0 + t * dx, y0 + t * dy);
            if (px - cx).powi(2) + (py - cy).powi(2) <= r2 {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

/// Axis-aligned square outline; `stroke` pixels wide, drawn inside the
/// `side`×`side` box at `(x, y)`.
pub fn draw_square_outline(img: &mut RgbImage, x: u32, y: u32, side: u32, stroke: u32, color: Rgb<u8>) {
    for py in y..y + side {
        for px in x..x + side {
            let inner = px >= x + stroke
                && px < x + side - stroke
                && py >= y + stroke
                && py < y + side - stroke;
            if !inner && px < img.width() && py < img.height() {
                img.put_pixel(px, py, color);
            }
        }
    }
}

/// UTM 33N sheet near the central meridian, 10 cm pixels.
pub fn utm33_transform() -> GeoTransform {
    GeoTransform::from_gdal([500_000.0, 0.1, 0.0, 5_760_000.0, 0.0, -0.1]).unwrap()
}

/// Save as PNG with a `.pgw` world file.
pub fn write_georeferenced(dir: &Path, name: &str, img: &RgbImage, transform: &GeoTransform) -> PathBuf {
    let path = dir.join(name);
    img.save(&path).unwrap();
    transform.write_world_file(&path).unwrap();
    path
}
