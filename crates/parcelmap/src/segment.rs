//! Boundary segmentation of a single raster patch.
//!
//! Stages, each a pure function of its input buffer:
//!
//! 1. mean-shift smoothing (joint spatial/color window) to flatten near-uniform
//!    regions and cut down the number of edges,
//! 2. BT.601 luma,
//! 3. Canny edges (Gaussian σ, Sobel, direction-aligned NMS, hysteresis),
//! 4. exact Euclidean distance to the nearest edge,
//! 5. local maxima of the distance field as growth markers,
//! 6. a growth mask of dark pixels (`<= threshold`),
//! 7. marker-controlled watershed on the negated distance field,
//! 8. binarization of the labeled basins to {0, 255}.
//!
//! A patch without edges has no markers and yields an all-zero mask.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use imageproc::definitions::Image;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::config::SegmentParams;

/// Segment one patch into a boundary mask (255 = boundary region).
pub fn segment_patch(patch: &RgbImage, params: &SegmentParams) -> GrayImage {
    let (w, h) = patch.dimensions();
    let mut mask = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return mask;
    }

    let shifted = mean_shift_filter(
        patch,
        params.spatial_radius,
        params.color_radius,
        params.mean_shift_max_iter,
    );
    let gray = to_intensity(&shifted);

    let edges = canny(
        &gray,
        params.sigma,
        params.canny_low * 255.0,
        params.canny_high * 255.0,
    );

    let Some(dist) = distance_to_edges(&edges) else {
        return mask;
    };

    let markers = local_maxima(&dist, w, h, params.min_distance);
    let labels = connected_components(&markers, Connectivity::Eight, Luma([0u8]));

    let growth: Vec<bool> = gray
        .as_raw()
        .iter()
        .map(|&v| v <= params.threshold)
        .collect();

    let basins = watershed(&dist, labels.as_raw(), &growth, w as usize, h as usize);

    for (dst, &label) in mask.iter_mut().zip(basins.iter()) {
        if label > 0 {
            *dst = 255;
        }
    }

    mask
}

/// Edge-preserving mean-shift filtering.
///
/// Every pixel walks towards the mean position and color of its neighbours
/// that lie within `spatial_radius` in space and `color_radius` in RGB until
/// the shift is at most one unit or `max_iter` is reached. The pixel takes the
/// color of the mode it converged to.
///
/// Windows that lie fully inside the image and hold a single color are
/// resolved from integral images without visiting their pixels.
pub fn mean_shift_filter(
    src: &RgbImage,
    spatial_radius: u32,
    color_radius: f32,
    max_iter: u32,
) -> RgbImage {
    if spatial_radius == 0 || max_iter == 0 {
        return src.clone();
    }

    let window = MeanShiftWindow {
        spatial_radius: spatial_radius as i64,
        color_radius_sq: (color_radius * color_radius) as i64,
        max_iter,
    };
    let stats = WindowStats::new(src);

    RgbImage::from_fn(src.width(), src.height(), |x, y| {
        window.converge(src, Some(&stats), x, y)
    })
}

#[derive(Debug, Clone, Copy)]
struct MeanShiftWindow {
    spatial_radius: i64,
    color_radius_sq: i64,
    max_iter: u32,
}

fn color_dist_sq(a: [i64; 3], b: [i64; 3]) -> i64 {
    (0..3).map(|k| (a[k] - b[k]) * (a[k] - b[k])).sum()
}

impl MeanShiftWindow {
    /// Mode color reached from pixel `(x_start, y_start)`.
    fn converge(
        &self,
        src: &RgbImage,
        stats: Option<&WindowStats>,
        x_start: u32,
        y_start: u32,
    ) -> Rgb<u8> {
        let (wi, hi) = (src.width() as i64, src.height() as i64);
        let sp = self.spatial_radius;
        let raw = src.as_raw();
        let stride = src.width() as usize * 3;

        let mut x = x_start as i64;
        let mut y = y_start as i64;
        let mut c = src.get_pixel(x_start, y_start).0.map(i64::from);

        for _ in 0..self.max_iter {
            let (x0, x1) = ((x - sp).max(0), (x + sp).min(wi - 1));
            let (y0, y1) = ((y - sp).max(0), (y + sp).min(hi - 1));

            let unclipped = x0 == x - sp && x1 == x + sp && y0 == y - sp && y1 == y + sp;
            if let (true, Some(stats)) = (unclipped, stats) {
                if let Some(u) = stats.uniform_color(x0 as u32, y0 as u32, x1 as u32, y1 as u32) {
                    if color_dist_sq(u, c) < self.color_radius_sq {
                        c = u;
                    }
                    break;
                }
            }

            let (mut sx, mut sy, mut n) = (0i64, 0i64, 0i64);
            let mut sc = [0i64; 3];

            for wy in y0..=y1 {
                let row = &raw[wy as usize * stride..][x0 as usize * 3..(x1 as usize + 1) * 3];
                for (wx, p) in (x0..=x1).zip(row.chunks_exact(3)) {
                    let p = [p[0] as i64, p[1] as i64, p[2] as i64];
                    if color_dist_sq(p, c) >= self.color_radius_sq {
                        continue;
                    }
                    sx += wx;
                    sy += wy;
                    sc[0] += p[0];
                    sc[1] += p[1];
                    sc[2] += p[2];
                    n += 1;
                }
            }

            if n == 0 {
                break;
            }

            let nx = div_round(sx, n);
            let ny = div_round(sy, n);
            let nc = sc.map(|s| div_round(s, n));

            let shift = (nx - x).abs() + (ny - y).abs() + color_dist_sq(nc, c);

            x = nx;
            y = ny;
            c = nc;

            if shift <= 1 {
                break;
            }
        }

        Rgb(c.map(|v| v.clamp(0, 255) as u8))
    }
}

/// Per-channel sums and sums of squares over any rectangle.
struct WindowStats {
    sum: Image<Rgb<u64>>,
    sum_sq: Image<Rgb<u64>>,
}

impl WindowStats {
    fn new(src: &RgbImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(src),
            sum_sq: integral_squared_image::<_, u64>(src),
        }
    }

    /// The color shared by every pixel of the inclusive rectangle, if any.
    fn uniform_color(&self, left: u32, top: u32, right: u32, bottom: u32) -> Option<[i64; 3]> {
        let n = u64::from(right - left + 1) * u64::from(bottom - top + 1);
        let s = rect_sum(&self.sum, left, top, right, bottom);
        let q = rect_sum(&self.sum_sq, left, top, right, bottom);

        (0..3)
            .all(|k| n * q[k] == s[k] * s[k])
            .then(|| s.map(|v| (v / n) as i64))
    }
}

fn rect_sum(integral: &Image<Rgb<u64>>, left: u32, top: u32, right: u32, bottom: u32) -> [u64; 3] {
    let at = |x: u32, y: u32| integral.get_pixel(x, y).0;
    let (br, bl, tr, tl) = (
        at(right + 1, bottom + 1),
        at(left, bottom + 1),
        at(right + 1, top),
        at(left, top),
    );
    std::array::from_fn(|k| br[k] + tl[k] - bl[k] - tr[k])
}

#[inline]
fn div_round(num: i64, den: i64) -> i64 {
    (num as f64 / den as f64).round() as i64
}

/// ITU-R BT.601 luma.
pub fn to_intensity(src: &RgbImage) -> GrayImage {
    GrayImage::from_fn(src.width(), src.height(), |x, y| {
        let [r, g, b] = src.get_pixel(x, y).0;
        let v = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        Luma([v.min(255) as u8])
    })
}

const TAN_22_5_DEG: f32 = 0.414_213_56;

/// Canny edge map (255 = edge). Thresholds are in Sobel magnitude units of
/// the 8-bit input.
pub fn canny(gray: &GrayImage, sigma: f32, low: f32, high: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut out = GrayImage::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }
    let (w, h) = (w as usize, h as usize);

    let blurred = if sigma > 0.0 {
        gaussian_blur_f32(gray, sigma)
    } else {
        gray.clone()
    };

    let gx = horizontal_sobel(&blurred);
    let gy = vertical_sobel(&blurred);
    let (gx, gy) = (gx.as_raw(), gy.as_raw());

    let mag: Vec<f32> = gx
        .iter()
        .zip(gy.iter())
        .map(|(&x, &y)| (x as f32).hypot(y as f32))
        .collect();

    // Non-maximum suppression along the quantized gradient direction; the
    // outermost frame is left empty.
    let mut nms = vec![0f32; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let m = mag[i];
            if m < low || m == 0.0 {
                continue;
            }

            let (gxv, gyv) = (gx[i] as f32, gy[i] as f32);
            let (ax, ay) = (gxv.abs(), gyv.abs());
            let same_sign = (gxv >= 0.0) == (gyv >= 0.0);

            let (n1, n2) = if ay <= ax * TAN_22_5_DEG {
                (mag[i - 1], mag[i + 1])
            } else if ax <= ay * TAN_22_5_DEG {
                (mag[i - w], mag[i + w])
            } else if same_sign {
                (mag[i - w - 1], mag[i + w + 1])
            } else {
                (mag[i - w + 1], mag[i + w - 1])
            };

            if m < n1 || m < n2 {
                continue;
            }
            nms[i] = m;
        }
    }

    // Hysteresis: grow strong edges through 8-connected weak ones.
    let mut stack: Vec<usize> = Vec::new();
    let data = out.as_mut();
    for (i, &m) in nms.iter().enumerate() {
        if m >= high && m > 0.0 && data[i] == 0 {
            data[i] = 255;
            stack.push(i);

            while let Some(p) = stack.pop() {
                let (px, py) = ((p % w) as i64, (p / w) as i64);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let (nx, ny) = (px + dx, py + dy);
                        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                            continue;
                        }
                        let j = ny as usize * w + nx as usize;
                        if data[j] == 0 && nms[j] >= low && nms[j] > 0.0 {
                            data[j] = 255;
                            stack.push(j);
                        }
                    }
                }
            }
        }
    }

    out
}

/// Exact Euclidean distance from every pixel to the nearest edge pixel.
///
/// Returns `None` when the map has no edge pixel at all.
pub fn distance_to_edges(edges: &GrayImage) -> Option<Vec<f32>> {
    if !edges.as_raw().iter().any(|&v| v != 0) {
        return None;
    }

    let squared = euclidean_squared_distance_transform(edges);
    Some(squared.as_raw().iter().map(|&s| s.sqrt() as f32).collect())
}

/// Pixels equal to the maximum of their `(2r+1)²` neighbourhood and strictly
/// above the global minimum; an `r`-pixel border is excluded.
fn local_maxima(dist: &[f32], w: u32, h: u32, radius: u32) -> GrayImage {
    let mut out = GrayImage::new(w, h);
    let (wu, hu, r) = (w as usize, h as usize, radius.max(1) as usize);
    if wu <= 2 * r || hu <= 2 * r {
        return out;
    }

    let floor = dist.iter().copied().fold(f32::INFINITY, f32::min);

    for y in r..hu - r {
        for x in r..wu - r {
            let v = dist[y * wu + x];
            if v <= floor {
                continue;
            }

            let is_peak = (y - r..=y + r)
                .all(|yy| dist[yy * wu + x - r..=yy * wu + x + r].iter().all(|&n| n <= v));

            if is_peak {
                out.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }

    out
}

/// Priority-flood item; lower elevation pops first, ties by insertion age.
#[derive(Debug)]
struct FloodItem {
    elevation: f32,
    age: u64,
    idx: usize,
}

impl PartialEq for FloodItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloodItem {}

impl PartialOrd for FloodItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .elevation
            .total_cmp(&self.elevation)
            .then_with(|| other.age.cmp(&self.age))
    }
}

/// Marker-controlled watershed on `-dist`, 4-connected, confined to `growth`.
/// Markers outside the growth mask are ignored.
fn watershed(dist: &[f32], markers: &[u32], growth: &[bool], w: usize, h: usize) -> Vec<u32> {
    let mut labels = vec![0u32; w * h];
    let mut heap = BinaryHeap::new();
    let mut age = 0u64;

    for (i, &m) in markers.iter().enumerate() {
        if m > 0 && growth[i] {
            labels[i] = m;
            heap.push(FloodItem {
                elevation: -dist[i],
                age,
                idx: i,
            });
            age += 1;
        }
    }

    while let Some(item) = heap.pop() {
        let label = labels[item.idx];
        let (x, y) = (item.idx % w, item.idx / w);

        let neighbours = [
            (x > 0).then(|| item.idx - 1),
            (x + 1 < w).then(|| item.idx + 1),
            (y > 0).then(|| item.idx - w),
            (y + 1 < h).then(|| item.idx + w),
        ];

        for j in neighbours.into_iter().flatten() {
            if growth[j] && labels[j] == 0 {
                labels[j] = label;
                heap.push(FloodItem {
                    elevation: -dist[j],
                    age,
                    idx: j,
                });
                age += 1;
            }
        }
    }

    labels
}
