use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::errors::{Result, SegError};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GT_CITATION: u16 = 1026;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Spatial extent and coordinate reference system of the input raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    pub extent_xmin: f64,
    pub extent_xmax: f64,
    pub extent_ymin: f64,
    pub extent_ymax: f64,
    #[serde(default)]
    pub crs: Option<String>,
}

impl GeoReference {
    /// Pixel size and top-left tie point of a north-up grid spanning the
    /// extent.
    pub fn transform(&self, width: usize, height: usize) -> Result<([f64; 3], [f64; 6])> {
        if width == 0 || height == 0 {
            return Err(SegError::invalid_argument("mask", "is empty"));
        }
        let x_res = (self.extent_xmax - self.extent_xmin) / width as f64;
        let y_res = (self.extent_ymax - self.extent_ymin) / height as f64;
        if !(x_res > 0.0 && y_res > 0.0) {
            return Err(SegError::invalid_argument(
                "georeference_data",
                "extent must have max > min on both axes",
            ));
        }
        Ok((
            [x_res, y_res, 0.0],
            [0.0, 0.0, 0.0, self.extent_xmin, self.extent_ymax, 0.0],
        ))
    }
}

/// Numeric EPSG code of an `EPSG:<code>` CRS string.
fn epsg_code(crs: &str) -> Option<u16> {
    let (authority, code) = crs.trim().split_once(':')?;
    if !authority.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

/// GeoKeyDirectory entries plus the ASCII params they reference.
fn geo_keys(crs: Option<&str>) -> (Vec<u16>, String) {
    let citation = crs.unwrap_or_default();
    let ascii = format!("{citation}|");
    let code = crs.and_then(epsg_code);
    let geographic = matches!(code, Some(4000..=4999));

    let mut keys = vec![
        (
            GT_MODEL_TYPE,
            0,
            1,
            if geographic {
                MODEL_TYPE_GEOGRAPHIC
            } else {
                MODEL_TYPE_PROJECTED
            },
        ),
        (GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA),
        (GT_CITATION, GEO_ASCII_PARAMS, ascii.len() as u16, 0),
    ];
    if let Some(code) = code {
        let key = if geographic {
            GEOGRAPHIC_TYPE
        } else {
            PROJECTED_CS_TYPE
        };
        keys.push((key, 0, 1, code));
    }
    keys.sort_by_key(|k| k.0);

    let mut directory = vec![1, 1, 0, keys.len() as u16];
    for (id, location, count, value) in keys {
        directory.extend([id, location, count, value]);
    }
    (directory, ascii)
}

/// Writes a single-band 8-bit GeoTIFF of class indices.
pub fn write_geotiff(path: &Path, mask: ArrayView2<u8>, geo: &GeoReference) -> Result<()> {
    let (height, width) = mask.dim();
    let (scale, tiepoint) = geo.transform(width, height)?;
    let (directory, ascii) = geo_keys(geo.crs.as_deref());

    let file = File::create(path).map_err(|e| SegError::FileSystem {
        path: path.to_path_buf(),
        operation: "GeoTIFF create".to_string(),
        source: e,
    })?;
    let data: Vec<u8> = mask.iter().copied().collect();

    let encode = || -> std::result::Result<(), tiff::TiffError> {
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        let mut image = encoder.new_image::<colortype::Gray8>(width as u32, height as u32)?;
        let dir = image.encoder();
        dir.write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &scale[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tiepoint[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), &directory[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(GEO_ASCII_PARAMS), ascii.as_str())?;
        image.write_data(&data)
    };

    encode().map_err(|e| SegError::FileSystem {
        path: path.to_path_buf(),
        operation: "GeoTIFF encode".to_string(),
        source: std::io::Error::other(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiff::decoder::{Decoder, DecodingResult};

    fn extent(crs: &str) -> GeoReference {
        GeoReference {
            extent_xmin: 100.0,
            extent_xmax: 200.0,
            extent_ymin: 50.0,
            extent_ymax: 100.0,
            crs: Some(crs.to_string()),
        }
    }

    #[test]
    fn transform_from_extent() -> Result<()> {
        let (scale, tiepoint) = extent("EPSG:32633").transform(10, 5)?;
        assert_eq!(scale, [10.0, 10.0, 0.0]);
        assert_eq!(tiepoint[3..5], [100.0, 100.0]);
        Ok(())
    }

    #[test]
    fn inverted_extent_is_rejected() {
        let mut geo = extent("EPSG:4326");
        geo.extent_xmax = 0.0;
        assert!(geo.transform(4, 4).is_err());
    }

    #[test]
    fn geographic_epsg_codes_set_geographic_model() {
        let (directory, ascii) = geo_keys(Some("EPSG:4326"));
        assert_eq!(ascii, "EPSG:4326|");
        assert_eq!(directory[3], 4);
        assert!(directory
            .chunks(4)
            .any(|k| k == [GEOGRAPHIC_TYPE, 0, 1, 4326]));
        assert!(directory
            .chunks(4)
            .any(|k| k == [GT_MODEL_TYPE, 0, 1, MODEL_TYPE_GEOGRAPHIC]));
    }

    #[test]
    fn wkt_crs_is_kept_as_citation_only() {
        let (directory, ascii) = geo_keys(Some("PROJCS[\"WGS 84 / UTM zone 33N\"]"));
        assert!(ascii.starts_with("PROJCS"));
        assert_eq!(directory[3], 3);
    }

    #[test]
    fn written_file_decodes_with_tags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mask.tif");
        let mask = Array2::from_shape_fn((5, 10), |(y, x)| ((x + y) % 6) as u8);
        write_geotiff(&path, mask.view(), &extent("EPSG:32633"))?;

        let mut decoder = Decoder::new(File::open(&path)?).map_err(std::io::Error::other)?;
        assert_eq!(decoder.dimensions().map_err(std::io::Error::other)?, (10, 5));
        let scale = decoder
            .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))
            .map_err(std::io::Error::other)?;
        assert_eq!(scale, vec![10.0, 10.0, 0.0]);
        match decoder.read_image().map_err(std::io::Error::other)? {
            DecodingResult::U8(data) => assert_eq!(data, mask.iter().copied().collect::<Vec<_>>()),
            _ => panic!("expected 8-bit samples"),
        }
        Ok(())
    }
}
