//! Projected CRS ↔ WGS-84 geographic coordinates, via proj4rs.
//!
//! EPSG:4326 is defined latitude-first. [`Reprojector::to_geographic`] returns
//! vertices in that authority order; [`AxisOrder::normalize`] turns them into
//! the longitude-first order expected by `geo` algorithms and GeoJSON.

use std::fmt;
use std::str::FromStr;

use geo::{Coord, MapCoords, Polygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::{Error, Result};

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;

const WGS84_PROJ: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Operator-declared coordinate reference system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrsId {
    Epsg(u32),
    /// Raw PROJ.4 definition, used verbatim.
    Proj(String),
}

impl CrsId {
    pub fn epsg(&self) -> Option<u32> {
        match self {
            CrsId::Epsg(code) => Some(*code),
            CrsId::Proj(_) => None,
        }
    }

    pub fn proj_string(&self) -> Result<String> {
        match self {
            CrsId::Proj(s) => Ok(s.clone()),
            CrsId::Epsg(EPSG_WGS84) => Ok(WGS84_PROJ.to_string()),
            CrsId::Epsg(EPSG_WEB_MERCATOR) => Ok(
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                    .to_string(),
            ),
            CrsId::Epsg(code @ 32601..=32660) => Ok(format!(
                "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
                code - 32600
            )),
            CrsId::Epsg(code @ 32701..=32760) => Ok(format!(
                "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
                code - 32700
            )),
            CrsId::Epsg(code) => Err(Error::config(format!(
                "EPSG:{code} is not supported; pass a +proj definition instead"
            ))),
        }
    }

    pub fn is_geographic(&self) -> bool {
        match self {
            CrsId::Epsg(code) => *code == EPSG_WGS84,
            CrsId::Proj(s) => s.contains("+proj=longlat") || s.contains("+proj=latlong"),
        }
    }
}

impl FromStr for CrsId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with("+proj") {
            return Ok(CrsId::Proj(s.to_string()));
        }

        let code = s
            .strip_prefix("EPSG:")
            .or_else(|| s.strip_prefix("epsg:"))
            .unwrap_or(s);

        let code: u32 = code
            .parse()
            .map_err(|_| Error::config(format!("cannot parse CRS '{s}'")))?;

        let crs = CrsId::Epsg(code);
        // Fail early on codes without a known definition.
        crs.proj_string()?;
        Ok(crs)
    }
}

impl fmt::Display for CrsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrsId::Epsg(code) => write!(f, "EPSG:{code}"),
            CrsId::Proj(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrder {
    LonLat,
    LatLon,
}

impl AxisOrder {
    /// Return `poly` with longitude on x and latitude on y.
    pub fn normalize(self, poly: Polygon<f64>) -> Polygon<f64> {
        match self {
            AxisOrder::LonLat => poly,
            AxisOrder::LatLon => poly.map_coords(|Coord { x, y }| Coord { x: y, y: x }),
        }
    }
}

pub struct Reprojector {
    source: Proj,
    target: Proj,
    crs: CrsId,
    source_is_geographic: bool,
}

impl fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reprojector")
            .field("crs", &self.crs)
            .finish_non_exhaustive()
    }
}

impl Reprojector {
    pub fn new(source: &CrsId) -> Result<Self> {
        let source_def = source.proj_string()?;
        let source_proj = Proj::from_proj_string(&source_def)
            .map_err(|e| Error::config(format!("invalid source CRS {source}: {e:?}")))?;
        let target = Proj::from_proj_string(WGS84_PROJ)
            .map_err(|e| Error::config(format!("invalid WGS-84 definition: {e:?}")))?;

        Ok(Self {
            source: source_proj,
            target,
            crs: source.clone(),
            source_is_geographic: source.is_geographic(),
        })
    }

    /// Axis order of [`to_geographic`](Self::to_geographic) output.
    pub fn geographic_axis_order(&self) -> AxisOrder {
        AxisOrder::LatLon
    }

    /// One projected point to `(lon, lat)` in degrees.
    pub fn point_to_lon_lat(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let mut p = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source, &self.target, &mut p)
            .map_err(|e| Error::geometry(format!("cannot reproject ({x}, {y}): {e:?}")))?;
        Ok((p.0.to_degrees(), p.1.to_degrees()))
    }

    /// `(lon, lat)` in degrees back to the projected CRS.
    pub fn point_to_projected(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        let mut p = (lon.to_radians(), lat.to_radians(), 0.0);
        transform(&self.target, &self.source, &mut p)
            .map_err(|e| Error::geometry(format!("cannot reproject ({lon}, {lat}): {e:?}")))?;
        if self.source_is_geographic {
            Ok((p.0.to_degrees(), p.1.to_degrees()))
        } else {
            Ok((p.0, p.1))
        }
    }

    /// Projected polygon to EPSG:4326 in authority (lat, lon) order.
    pub fn to_geographic(&self, poly: &Polygon<f64>) -> Result<Polygon<f64>> {
        poly.try_map_coords(|Coord { x, y }| {
            let (lon, lat) = self.point_to_lon_lat(x, y)?;
            Ok(Coord { x: lat, y: lon })
        })
    }

    /// Longitude-first geographic polygon back to the projected CRS.
    pub fn to_projected(&self, poly: &Polygon<f64>) -> Result<Polygon<f64>> {
        poly.try_map_coords(|Coord { x, y }| {
            let (px, py) = self.point_to_projected(x, y)?;
            Ok(Coord { x: px, y: py })
        })
    }
}
