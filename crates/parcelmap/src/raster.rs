//! Raster and mask IO.
//!
//! Pixels are decoded with `image`; the georeference comes from GeoTIFF model
//! tags when present, otherwise from a sidecar world file.
//!
//! GeoTIFF tags consulted:
//!   33550  ModelPixelScaleTag
//!   33922  ModelTiepointTag
//!   34264  ModelTransformationTag
//!   34735  GeoKeyDirectoryTag (GTRasterTypeGeoKey 1025, ProjectedCSTypeGeoKey 3072)

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};
use log::{debug, info, warn};
use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::geotransform::GeoTransform;

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;

const KEY_RASTER_TYPE: u32 = 1025;
const KEY_PROJECTED_CS_TYPE: u32 = 3072;
const RASTER_PIXEL_IS_POINT: u32 = 2;

/// Source raster with its pixel → projected mapping.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub image: RgbImage,
    pub transform: GeoTransform,
}

/// Where the geotransform came from, plus the EPSG code the file declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Georeference {
    pub transform: GeoTransform,
    pub projected_cs: Option<u32>,
    pub source: GeorefSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeorefSource {
    GeoTiff,
    WorldFile(PathBuf),
}

fn is_tiff(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("tif") | Some("tiff")
    )
}

/// Decode any supported raster as 8-bit RGB. Gray input is replicated; with
/// `strip_alpha` a 4-channel image loses its alpha band, otherwise an alpha
/// band is reported and dropped all the same.
pub fn load_rgb(path: &Path, strip_alpha: bool) -> Result<RgbImage> {
    if !is_tiff(path) {
        warn!("{} is not a GeoTIFF; expecting a world file", path.display());
    }

    let img = image::open(path)?;
    let color = img.color();
    if color.has_alpha() && !strip_alpha {
        warn!(
            "{} has an alpha band ({color:?}); dropping it (pass --rgba to silence)",
            path.display()
        );
    }
    if strip_alpha && !color.has_alpha() {
        debug!("{}: no alpha band to strip", path.display());
    }

    let rgb = img.to_rgb8();
    info!(
        "Read raster {} ({}x{}, {color:?})",
        path.display(),
        rgb.width(),
        rgb.height()
    );
    Ok(rgb)
}

/// GeoTIFF model tags, if the file is a TIFF carrying them.
pub fn read_geotiff_tags(path: &Path) -> Result<Option<(GeoTransform, Option<u32>)>> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?;

    let find_f64 = |d: &mut Decoder<BufReader<File>>, code: u16| -> Result<Option<Vec<f64>>> {
        match d.find_tag(Tag::from_u16_exhaustive(code))? {
            Some(v) => Ok(Some(v.into_f64_vec()?)),
            None => Ok(None),
        }
    };

    let transformation = find_f64(&mut decoder, TAG_MODEL_TRANSFORMATION)?;
    let scale = find_f64(&mut decoder, TAG_MODEL_PIXEL_SCALE)?;
    let tiepoint = find_f64(&mut decoder, TAG_MODEL_TIEPOINT)?;

    let transform = match (transformation, scale, tiepoint) {
        (Some(m), _, _) => GeoTransform::from_model_transformation(&m)?,
        (None, Some(s), Some(t)) => GeoTransform::from_tiepoint_scale(&t, &s)?,
        _ => return Ok(None),
    };

    let keys = match decoder.find_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY))? {
        Some(v) => v.into_u32_vec()?,
        None => Vec::new(),
    };

    let transform = if geo_key(&keys, KEY_RASTER_TYPE) == Some(RASTER_PIXEL_IS_POINT) {
        debug!("{}: PixelIsPoint, shifting origin by half a pixel", path.display());
        transform.shifted(-0.5, -0.5)
    } else {
        transform
    };

    Ok(Some((transform, geo_key(&keys, KEY_PROJECTED_CS_TYPE))))
}

/// Inline (location 0) value of `key` in a GeoKeyDirectory.
fn geo_key(directory: &[u32], key: u32) -> Option<u32> {
    let n = *directory.get(3)? as usize;
    directory
        .get(4..)?
        .chunks_exact(4)
        .take(n)
        .find(|entry| entry[0] == key && entry[1] == 0)
        .map(|entry| entry[3])
}

/// Georeference of `path`: GeoTIFF tags first, then the world file.
pub fn read_georeference(path: &Path) -> Result<Option<Georeference>> {
    if is_tiff(path) {
        match read_geotiff_tags(path) {
            Ok(Some((transform, projected_cs))) => {
                return Ok(Some(Georeference {
                    transform,
                    projected_cs,
                    source: GeorefSource::GeoTiff,
                }))
            }
            Ok(None) => debug!("{}: no GeoTIFF model tags", path.display()),
            Err(e) => warn!("{}: cannot read GeoTIFF tags: {e}", path.display()),
        }
    }

    Ok(GeoTransform::read_world_file(path)?.map(|transform| Georeference {
        transform,
        projected_cs: None,
        source: GeorefSource::WorldFile(crate::geotransform::world_file_path(path)),
    }))
}

/// Load pixels and georeference; a raster without either GeoTIFF tags or a
/// world file cannot be vectorized.
pub fn load_geo_raster(path: &Path, strip_alpha: bool) -> Result<GeoRaster> {
    let image = load_rgb(path, strip_alpha)?;
    let georef = read_georeference(path)?.ok_or_else(|| {
        Error::config(format!(
            "{} has no geotransform (no GeoTIFF tags, no world file)",
            path.display()
        ))
    })?;
    Ok(GeoRaster {
        image,
        transform: georef.transform,
    })
}

/// Write a {0,255} mask; with a transform, also its world file.
pub fn save_mask(mask: &GrayImage, path: &Path, transform: Option<&GeoTransform>) -> Result<()> {
    mask.save(path)?;
    if let Some(t) = transform {
        let wf = t.write_world_file(path)?;
        debug!("wrote world file {}", wf.display());
    }
    info!("Saved mask {}", path.display());
    Ok(())
}

/// Load a mask; any non-zero pixel is boundary (255).
pub fn load_mask(path: &Path) -> Result<GrayImage> {
    let mut mask = image::open(path)?.to_luma8();
    for v in mask.iter_mut() {
        *v = if *v > 0 { 255 } else { 0 };
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, Rgba, RgbaImage};

    #[test]
    fn geo_key_directory_lookup() {
        let dir = [1, 1, 0, 2, 1025, 0, 1, 2, 3072, 0, 1, 32633];
        assert_eq!(geo_key(&dir, KEY_RASTER_TYPE), Some(2));
        assert_eq!(geo_key(&dir, KEY_PROJECTED_CS_TYPE), Some(32633));
        assert_eq!(geo_key(&dir, 2048), None);
        assert_eq!(geo_key(&[], 1025), None);
    }

    #[test]
    fn mask_and_world_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let mut mask = GrayImage::new(8, 6);
        mask.put_pixel(3, 2, Luma([255]));
        let t = GeoTransform::from_gdal([500_000.0, 0.1, 0.0, 5_760_000.0, 0.0, -0.1]).unwrap();

        save_mask(&mask, &path, Some(&t)).unwrap();
        assert_eq!(load_mask(&path).unwrap(), mask);

        let georef = read_georeference(&path).unwrap().unwrap();
        assert_eq!(georef.transform, t);
        assert_eq!(georef.source, GeorefSource::WorldFile(dir.path().join("mask.pgw")));
    }

    #[test]
    fn raster_without_georeference_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])).save(&path).unwrap();
        assert!(matches!(load_geo_raster(&path, false), Err(Error::Config(_))));
    }

    #[test]
    fn rgba_input_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgba.png");
        RgbaImage::from_pixel(3, 3, Rgba([10, 20, 30, 0])).save(&path).unwrap();
        let rgb = load_rgb(&path, true).unwrap();
        assert_eq!(*rgb.get_pixel(1, 1), Rgb([10, 20, 30]));
    }

    #[test]
    fn loaded_masks_are_binarized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soft.png");
        GrayImage::from_fn(4, 1, |x, _| Luma([x as u8 * 40])).save(&path).unwrap();
        let m = load_mask(&path).unwrap();
        assert_eq!(m.as_raw(), &vec![0, 255, 255, 255]);
    }
}
