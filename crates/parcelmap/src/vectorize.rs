//! Merged mask → georeferenced parcel polygons.
//!
//! The mask is skeletonized so every enclosed region becomes a hole of the
//! boundary network. Hole borders (and borders nested inside them) are the
//! parcel candidates; the top-level outer border of each network is not.

use std::collections::HashSet;

use geo::{Coord, GeodesicArea, Geometry, LineString, MultiPolygon, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use log::{debug, warn};

use crate::config::VectorizeParams;
use crate::error::{Error, Result};
use crate::geotransform::GeoTransform;
use crate::reproject::Reprojector;
use crate::skeleton::skeletonize;

/// A single parcel, longitude-first geographic coordinates, no holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: u32,
    pub polygon: Polygon<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorizeReport {
    pub contours_total: usize,
    pub contours_relevant: usize,
    pub polygons_repaired: usize,
    pub polygons_after_area_filter: usize,
    pub parcels: usize,
    pub skipped: usize,
}

pub type PixelRing = Vec<(i32, i32)>;

/// Vectorize a boundary mask. Returns the skeleton alongside the parcels so
/// callers can persist it for inspection.
pub fn vectorize(
    mask: &GrayImage,
    transform: &GeoTransform,
    reprojector: &Reprojector,
    params: &VectorizeParams,
) -> Result<(Vec<Parcel>, GrayImage, VectorizeReport)> {
    params.validate()?;
    let mut report = VectorizeReport::default();

    let skeleton = skeletonize(mask);
    let contours = find_contours::<i32>(&skeleton);
    report.contours_total = contours.len();

    let rings = relevant_contours(&contours);
    report.contours_relevant = rings.len();
    debug!(
        "{} contours, {} relevant",
        report.contours_total, report.contours_relevant
    );

    let mut candidates: Vec<Geometry<f64>> = Vec::new();
    for ring in &rings {
        let projected = georeference(ring, transform);
        let repaired = match repair(&projected, params) {
            Some(g) => g,
            None => continue,
        };
        report.polygons_repaired += 1;

        match to_lon_lat(repaired, reprojector) {
            Ok(g) => candidates.push(g),
            Err(e) => {
                warn!("skipping contour: {e}");
                report.skipped += 1;
            }
        }
    }

    // Areas are judged on the repaired geometry, holes and all parts included.
    let kept = filter_by_area(candidates, params.min_area_m2);
    report.polygons_after_area_filter = kept.len();

    let mut exteriors = Vec::new();
    for geometry in kept {
        match split_exteriors(geometry) {
            Ok(parts) => exteriors.extend(parts),
            Err(e) => {
                warn!("skipping parcel: {e}");
                report.skipped += 1;
            }
        }
    }

    let parcels = assign_ids(exteriors);
    report.parcels = parcels.len();

    Ok((parcels, skeleton, report))
}

/// CHAIN_APPROX_SIMPLE-style compression of a closed 8-connected chain:
/// interior points of straight horizontal, vertical or diagonal runs are
/// dropped.
pub fn compress_chain(points: &[(i32, i32)]) -> PixelRing {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }

    let step = |a: (i32, i32), b: (i32, i32)| (b.0 - a.0, b.1 - a.1);

    (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let next = points[(i + 1) % n];
            step(prev, points[i]) != step(points[i], next)
        })
        .map(|i| points[i])
        .collect()
}

fn distinct_points(ring: &[(i32, i32)]) -> usize {
    ring.iter().collect::<HashSet<_>>().len()
}

/// Contours that may bound a parcel: at least three distinct points and not
/// identical to any top-level outer border.
pub fn relevant_contours(contours: &[Contour<i32>]) -> Vec<PixelRing> {
    let compress = |c: &Contour<i32>| -> PixelRing {
        let pts: Vec<(i32, i32)> = c.points.iter().map(|p| (p.x, p.y)).collect();
        compress_chain(&pts)
    };

    let external: HashSet<PixelRing> = contours
        .iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
        .map(compress)
        .collect();

    contours
        .iter()
        .map(compress)
        .filter(|ring| distinct_points(ring) >= 3 && !external.contains(ring))
        .collect()
}

/// Pixel ring → projected polygon through the affine transform.
pub fn georeference(ring: &[(i32, i32)], transform: &GeoTransform) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|&(col, row)| {
            let (x, y) = transform.to_projected(col as f64, row as f64);
            Coord { x, y }
        })
        .collect();
    Polygon::new(LineString::from(coords), vec![])
}

/// Zero-distance mitre buffer; resolves self-intersections. `None` when
/// nothing with area survives.
pub fn repair(poly: &Polygon<f64>, params: &VectorizeParams) -> Option<Geometry<f64>> {
    let mut parts: MultiPolygon<f64> = poly.offset(
        0.0,
        JoinType::Miter(params.miter_limit),
        EndType::ClosedPolygon,
        params.repair_scale,
    );

    parts.0.retain(|p| p.exterior().0.len() >= 4);

    match parts.0.len() {
        0 => None,
        1 => parts.0.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(parts)),
    }
}

/// Repaired projected geometry to longitude-first EPSG:4326, keeping holes
/// and parts.
fn to_lon_lat(geometry: Geometry<f64>, reprojector: &Reprojector) -> Result<Geometry<f64>> {
    let order = reprojector.geographic_axis_order();
    let convert = |p: &Polygon<f64>| reprojector.to_geographic(p).map(|g| order.normalize(g));

    match geometry {
        Geometry::Polygon(p) => convert(&p).map(Geometry::Polygon),
        Geometry::MultiPolygon(mp) => {
            let parts = mp.0.iter().map(convert).collect::<Result<Vec<_>>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon(parts)))
        }
        other => Err(Error::geometry(format!(
            "expected a polygon after repair, got {}",
            geometry_kind(&other)
        ))),
    }
}

/// Exterior rings only; a multi-polygon yields one polygon per part.
pub fn split_exteriors(geometry: Geometry<f64>) -> Result<Vec<Polygon<f64>>> {
    match geometry {
        Geometry::Polygon(p) => Ok(vec![Polygon::new(p.exterior().clone(), vec![])]),
        Geometry::MultiPolygon(mp) => Ok(mp
            .0
            .into_iter()
            .map(|p| Polygon::new(p.exterior().clone(), vec![]))
            .collect()),
        other => Err(Error::geometry(format!(
            "expected a polygon after repair, got {}",
            geometry_kind(&other)
        ))),
    }
}

fn geometry_kind(g: &Geometry<f64>) -> &'static str {
    match g {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// WGS-84 geodesic area in m² of a longitude-first polygonal geometry. Holes
/// are subtracted and multi-polygon parts summed; other kinds have no area.
pub fn geodesic_area_m2(geometry: &Geometry<f64>) -> f64 {
    match geometry {
        Geometry::Polygon(p) => p.geodesic_area_unsigned(),
        Geometry::MultiPolygon(mp) => mp.0.iter().map(|p| p.geodesic_area_unsigned()).sum(),
        _ => 0.0,
    }
}

/// Keep geometries whose geodesic area is at least `min_area_m2`.
pub fn filter_by_area(geometries: Vec<Geometry<f64>>, min_area_m2: f64) -> Vec<Geometry<f64>> {
    geometries
        .into_iter()
        .filter(|g| geodesic_area_m2(g) >= min_area_m2)
        .collect()
}

/// Dense 1-based ids in input order.
pub fn assign_ids(polygons: Vec<Polygon<f64>>) -> Vec<Parcel> {
    polygons
        .into_iter()
        .zip(1u32..)
        .map(|(polygon, id)| Parcel { id, polygon })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, polygon, Area};
    use image::Luma;

    fn block_with_holes(holes: &[(u32, u32, u32)]) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| {
            let in_block = (10..90).contains(&x) && (10..90).contains(&y);
            let in_hole = holes
                .iter()
                .any(|&(hx, hy, s)| x >= hx && x < hx + s && y >= hy && y < hy + s);
            Luma([if in_block && !in_hole { 255 } else { 0 }])
        })
    }

    #[test]
    fn compress_collapses_straight_runs() {
        // 3x3 square traced clockwise, 8 boundary pixels.
        let chain = vec![
            (0, 0),
            (1, 0),
            (2, 0),
            (2, 1),
            (2, 2),
            (1, 2),
            (0, 2),
            (0, 1),
        ];
        assert_eq!(compress_chain(&chain), vec![(0, 0), (2, 0), (2, 2), (0, 2)]);
    }

    #[test]
    fn frame_with_two_holes_yields_the_two_inner_rings() {
        let mask = block_with_holes(&[(20, 20, 20), (55, 50, 25)]);
        let contours = find_contours::<i32>(&mask);
        assert_eq!(contours.len(), 3);

        let rings = relevant_contours(&contours);
        assert_eq!(rings.len(), 2);
        for ring in &rings {
            assert!(ring.iter().all(|&(x, y)| x > 10 && y > 10 && x < 89 && y < 89));
        }
    }

    #[test]
    fn lone_outer_border_is_not_relevant() {
        let mask = block_with_holes(&[]);
        assert!(relevant_contours(&find_contours::<i32>(&mask)).is_empty());
    }

    #[test]
    fn georeference_uses_affine_map() {
        let t = GeoTransform::from_gdal([1000.0, 2.0, 0.0, 500.0, 0.0, -2.0]).unwrap();
        let p = georeference(&[(0, 0), (10, 0), (10, 5)], &t);
        let c: Vec<_> = p.exterior().coords().copied().collect();
        assert_eq!(c[0], coord! { x: 1000.0, y: 500.0 });
        assert_eq!(c[1], coord! { x: 1020.0, y: 500.0 });
        assert_eq!(c[2], coord! { x: 1020.0, y: 490.0 });
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn repair_resolves_bow_tie_into_simple_parts() {
        let bow_tie = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 10.0),
        ];
        let repaired = repair(&bow_tie, &VectorizeParams::default()).unwrap();
        let parts = split_exteriors(repaired).unwrap();
        assert!(!parts.is_empty());
        for part in &parts {
            assert!((part.unsigned_area() - 25.0).abs() < 1e-3, "lobe area {}", part.unsigned_area());
        }
    }

    #[test]
    fn repair_drops_zero_area_ring() {
        let flat = polygon![(x: 0.0, y: 0.0), (x: 5.0, y: 0.0), (x: 10.0, y: 0.0)];
        assert!(repair(&flat, &VectorizeParams::default()).is_none());
    }

    #[test]
    fn holes_are_removed() {
        let with_hole = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]),
            vec![LineString::from(vec![(2.0, 2.0), (4.0, 2.0), (4.0, 4.0)])],
        );
        let parts = split_exteriors(Geometry::Polygon(with_hole)).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].interiors().is_empty());
    }

    #[test]
    fn non_polygon_repair_output_is_a_geometry_error() {
        let line = Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]));
        assert!(matches!(split_exteriors(line), Err(Error::Geometry(_))));
    }

    #[test]
    fn area_filter_is_monotonic() {
        // Squares of roughly 1, 100 and 10_000 m² near 52°N.
        let square = |side_deg: f64| {
            polygon![
                (x: 15.0, y: 52.0),
                (x: 15.0 + side_deg * 1.6, y: 52.0),
                (x: 15.0 + side_deg * 1.6, y: 52.0 + side_deg),
                (x: 15.0, y: 52.0 + side_deg),
            ]
        };
        let polys: Vec<Geometry<f64>> = [9e-6, 9e-5, 9e-4]
            .into_iter()
            .map(|side| Geometry::Polygon(square(side)))
            .collect();

        let mut last = usize::MAX;
        for min in [0.0, 0.5, 50.0, 5_000.0, 1e9] {
            let kept = filter_by_area(polys.clone(), min).len();
            assert!(kept <= last);
            last = kept;
        }
        assert_eq!(filter_by_area(polys.clone(), 0.0).len(), 3);
        assert_eq!(filter_by_area(polys, 1e9).len(), 0);
    }

    /// Square of `side_m` metres at 52°N, 15°E, longitude-first.
    fn square_m(x0_m: f64, y0_m: f64, side_m: f64) -> LineString<f64> {
        let (deg_lon, deg_lat) = (1.0 / 68_600.0, 1.0 / 111_250.0);
        let (x0, y0) = (15.0 + x0_m * deg_lon, 52.0 + y0_m * deg_lat);
        let (dx, dy) = (side_m * deg_lon, side_m * deg_lat);
        LineString::from(vec![(x0, y0), (x0 + dx, y0), (x0 + dx, y0 + dy), (x0, y0 + dy), (x0, y0)])
    }

    #[test]
    fn area_filter_subtracts_holes_before_they_are_dropped() {
        let with_hole = Polygon::new(square_m(0.0, 0.0, 10.0), vec![square_m(3.0, 3.0, 3.0)]);
        let net = geodesic_area_m2(&Geometry::Polygon(with_hole.clone()));
        assert!((net - 91.0).abs() < 2.0, "net area {net}");

        let kept = filter_by_area(vec![Geometry::Polygon(with_hole.clone())], 95.0);
        assert!(kept.is_empty());

        // The exterior alone would have passed.
        let exterior = split_exteriors(Geometry::Polygon(with_hole)).unwrap();
        assert!(exterior[0].geodesic_area_unsigned() >= 95.0);
    }

    #[test]
    fn area_filter_sums_multi_polygon_parts() {
        let parts = MultiPolygon(vec![
            Polygon::new(square_m(0.0, 0.0, 7.0), vec![]),
            Polygon::new(square_m(20.0, 0.0, 7.0), vec![]),
        ]);
        // Each part is about 49 m², together about 98 m².
        let kept = filter_by_area(vec![Geometry::MultiPolygon(parts)], 95.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(split_exteriors(kept.into_iter().next().unwrap()).unwrap().len(), 2);
    }

    /// One-pixel square loop with a smaller loop hanging inside it from a
    /// stalk; the big parcel's ring pinches around the small loop.
    fn loop_with_pocket() -> GrayImage {
        let mut mask = GrayImage::new(130, 130);
        let mut outline = |x0: u32, y0: u32, side: u32| {
            for t in 0..=side {
                for (x, y) in [(x0 + t, y0), (x0 + t, y0 + side), (x0, y0 + t), (x0 + side, y0 + t)] {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        };
        outline(10, 10, 100);
        outline(40, 40, 30);
        for y in 10..=40 {
            mask.put_pixel(55, y, Luma([255]));
        }
        mask
    }

    #[test]
    fn pocketed_parcel_is_judged_on_its_net_area() {
        let transform =
            GeoTransform::from_gdal([500_000.0, 0.1, 0.0, 5_760_000.0, 0.0, -0.1]).unwrap();
        let reprojector = Reprojector::new(&crate::reproject::CrsId::Epsg(32633)).unwrap();
        let mask = loop_with_pocket();

        let all = VectorizeParams::default();
        let (parcels, _, _) = vectorize(&mask, &transform, &reprojector, &all).unwrap();
        assert!(parcels
            .iter()
            .any(|p| p.polygon.geodesic_area_unsigned() > 95.0));

        let strict = VectorizeParams {
            min_area_m2: 95.0,
            ..Default::default()
        };
        let (parcels, _, report) = vectorize(&mask, &transform, &reprojector, &strict).unwrap();
        assert!(parcels.is_empty(), "{report:?}");
    }

    #[test]
    fn ids_are_dense_from_one() {
        let p = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)];
        let parcels = assign_ids(vec![p.clone(), p.clone(), p]);
        let ids: Vec<u32> = parcels.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
