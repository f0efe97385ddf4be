//! Zhang–Suen thinning.
//!
//! Neighbourhood labels used below (P1 is the pixel itself):
//!
//!   P9 P2 P3
//!   P8 P1 P4
//!   P7 P6 P5
//!
//! Pixels outside the image count as background.

use image::{GrayImage, Luma};

/// Reduce every foreground (non-zero) region of `mask` to a 1-pixel-wide,
/// topology-preserving skeleton. Output values are {0, 255}.
pub fn skeletonize(mask: &GrayImage) -> GrayImage {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut img: Vec<u8> = mask.as_raw().iter().map(|&v| u8::from(v != 0)).collect();

    let mut candidates: Vec<usize> = (0..w * h).filter(|&i| img[i] == 1).collect();
    let mut to_clear: Vec<usize> = Vec::new();

    loop {
        let mut changed = false;

        for step in 0..2 {
            to_clear.clear();
            for &i in &candidates {
                if img[i] == 1 && removable(&img, w, h, i, step) {
                    to_clear.push(i);
                }
            }
            for &i in &to_clear {
                img[i] = 0;
            }
            changed |= !to_clear.is_empty();
        }

        if !changed {
            break;
        }
        candidates.retain(|&i| img[i] == 1);
    }

    let data = img.into_iter().map(|v| v * 255).collect();
    GrayImage::from_raw(w as u32, h as u32, data)
        .unwrap_or_else(|| GrayImage::from_pixel(w as u32, h as u32, Luma([0])))
}

/// P2..P9 in clockwise order starting north.
#[inline]
fn neighbours(img: &[u8], w: usize, h: usize, i: usize) -> [u8; 8] {
    let (x, y) = ((i % w) as i64, (i / w) as i64);
    let at = |dx: i64, dy: i64| -> u8 {
        let (nx, ny) = (x + dx, y + dy);
        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
            0
        } else {
            img[ny as usize * w + nx as usize]
        }
    };
    [
        at(0, -1),
        at(1, -1),
        at(1, 0),
        at(1, 1),
        at(0, 1),
        at(-1, 1),
        at(-1, 0),
        at(-1, -1),
    ]
}

fn removable(img: &[u8], w: usize, h: usize, i: usize, step: usize) -> bool {
    let p = neighbours(img, w, h, i);
    let [p2, _, p4, _, p6, _, p8, _] = p;

    let b: u8 = p.iter().sum();
    if !(2..=6).contains(&b) {
        return false;
    }

    let transitions = (0..8).filter(|&k| p[k] == 0 && p[(k + 1) % 8] == 1).count();
    if transitions != 1 {
        return false;
    }

    if step == 0 {
        p2 * p4 * p6 == 0 && p4 * p6 * p8 == 0
    } else {
        p2 * p4 * p8 == 0 && p2 * p6 * p8 == 0
    }
}
