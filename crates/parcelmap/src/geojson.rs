//! GeoJSON feature collections of parcels.
//!
//! Written collections carry one `Polygon` feature per parcel with
//! `{ "parcelID": n, "parcelType": "n/a" }`. Reading also accepts
//! `MultiPolygon` features (split into parts) and 3D positions, which is what
//! external generalization tools tend to emit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use geo::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vectorize::Parcel;

pub const PARCEL_TYPE_UNKNOWN: &str = "n/a";

type Position = Vec<f64>;
type Ring = Vec<Position>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "parcelID", default, skip_serializing_if = "Option::is_none")]
    pub parcel_id: Option<u32>,
    #[serde(rename = "parcelType", default, skip_serializing_if = "Option::is_none")]
    pub parcel_type: Option<String>,
}

/// `<dir>/<stem>_raw.geojson` next to the final polygons file.
pub fn raw_path_for(polygons_path: &Path) -> PathBuf {
    let stem = polygons_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("polygons");
    polygons_path.with_file_name(format!("{stem}_raw.geojson"))
}

fn ring_to_json(ring: &LineString<f64>) -> Ring {
    let mut out: Ring = ring.coords().map(|c| vec![c.x, c.y]).collect();
    // GeoJSON rings are explicitly closed.
    if let (Some(first), Some(last)) = (out.first().cloned(), out.last()) {
        if &first != last {
            out.push(first);
        }
    }
    out
}

fn ring_from_json(ring: &[Position]) -> Result<LineString<f64>> {
    let coords = ring
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(Error::geometry(format!("position needs 2 values, got {p:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::from(coords))
}

fn polygon_from_json(rings: &[Ring]) -> Result<Polygon<f64>> {
    let (exterior, interiors) = rings
        .split_first()
        .ok_or_else(|| Error::geometry("polygon without rings"))?;
    let interiors = interiors
        .iter()
        .map(|r| ring_from_json(r))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(ring_from_json(exterior)?, interiors))
}

pub fn parcel_to_feature(parcel: &Parcel) -> Feature {
    let mut rings = vec![ring_to_json(parcel.polygon.exterior())];
    rings.extend(parcel.polygon.interiors().iter().map(ring_to_json));

    Feature {
        kind: "Feature".to_string(),
        geometry: Geometry::Polygon(rings),
        properties: Properties {
            parcel_id: Some(parcel.id),
            parcel_type: Some(PARCEL_TYPE_UNKNOWN.to_string()),
        },
    }
}

pub fn to_collection(parcels: &[Parcel]) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection".to_string(),
        features: parcels.iter().map(parcel_to_feature).collect(),
    }
}

/// Polygons of one feature; a multi-polygon yields one per part.
pub fn feature_polygons(feature: &Feature) -> Result<Vec<Polygon<f64>>> {
    match &feature.geometry {
        Geometry::Polygon(rings) => Ok(vec![polygon_from_json(rings)?]),
        Geometry::MultiPolygon(parts) => parts.iter().map(|r| polygon_from_json(r)).collect(),
    }
}

/// Polygons of a collection in feature order.
pub fn polygons_of(collection: &FeatureCollection) -> Result<Vec<Polygon<f64>>> {
    let mut out = Vec::with_capacity(collection.features.len());
    for feature in &collection.features {
        out.extend(feature_polygons(feature)?);
    }
    Ok(out)
}

pub fn write_parcels(path: &Path, parcels: &[Parcel]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &to_collection(parcels))?;
    writer.flush()?;
    Ok(())
}

pub fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Read parcels back. Features without a `parcelID` get their 1-based
/// position.
pub fn read_parcels(path: &Path) -> Result<Vec<Parcel>> {
    let collection = read_collection(path)?;
    let mut parcels = Vec::with_capacity(collection.features.len());

    for (idx, feature) in collection.features.iter().enumerate() {
        let id = feature.properties.parcel_id.unwrap_or(idx as u32 + 1);
        for polygon in feature_polygons(feature)? {
            parcels.push(Parcel { id, polygon });
        }
    }

    Ok(parcels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn parcel(id: u32) -> Parcel {
        Parcel {
            id,
            polygon: polygon![
                (x: 15.0, y: 52.0),
                (x: 15.001, y: 52.0),
                (x: 15.001, y: 52.001),
            ],
        }
    }

    #[test]
    fn feature_layout_matches_parcel_schema() {
        let json = serde_json::to_value(to_collection(&[parcel(1)])).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        let f = &json["features"][0];
        assert_eq!(f["type"], "Feature");
        assert_eq!(f["geometry"]["type"], "Polygon");
        assert_eq!(f["properties"]["parcelID"], 1);
        assert_eq!(f["properties"]["parcelType"], "n/a");

        let ring = f["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[0], ring[3]);
    }

    #[test]
    fn reads_multipolygons_and_3d_positions() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": { "cat": 4 },
                  "geometry": { "type": "MultiPolygon", "coordinates": [
                    [[[0,0,1],[1,0,1],[1,1,1],[0,0,1]]],
                    [[[5,5],[6,5],[6,6],[5,5]]]
                  ] } }
            ]
        }"#;
        let collection: FeatureCollection = serde_json::from_str(text).unwrap();
        let polys = polygons_of(&collection).unwrap();
        assert_eq!(polys.len(), 2);
        assert_eq!(polys[1].exterior().0[0], Coord { x: 5.0, y: 5.0 });
        assert!(collection.features[0].properties.parcel_id.is_none());
    }

    #[test]
    fn file_round_trip_keeps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.geojson");
        write_parcels(&path, &[parcel(1), parcel(2)]).unwrap();
        let back = read_parcels(&path).unwrap();
        assert_eq!(back.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(back[0].polygon.exterior().0.len(), 4);
    }

    #[test]
    fn raw_path_sits_next_to_final_output() {
        assert_eq!(
            raw_path_for(Path::new("out/sheet12.geojson")),
            Path::new("out/sheet12_raw.geojson")
        );
    }
}
