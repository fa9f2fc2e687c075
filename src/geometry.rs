//! Bounding box derivation from a GeoTIFF raster or a WKT polygon file.
//!
//! No reprojection is done: boxes are returned in the source's own CRS.
use crate::error::GeometryError;
use geo::BoundingRect;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tiff::decoder::Decoder;
use tiff::tags::Tag;
use tiff::TiffError;
use tracing::debug;
use wkt::TryFromWkt;

/// Axis aligned box as `(left, bottom, right, top)`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Bbox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.left, self.bottom, self.right, self.top]
    }

    /// Comma joined form used in the search URL, e.g. `-150.2,65.0,-150.1,65.5`.
    ///
    /// Debug formatting keeps the trailing `.0` on integral coordinates.
    pub fn to_query_value(&self) -> String {
        self.to_array()
            .iter()
            .map(|v| format!("{:?}", v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl From<[f64; 4]> for Bbox {
    fn from(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

/// Affine geotransform in GDAL order:
/// `(origin_x, x_res, row_rotation, origin_y, column_rotation, y_res)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub x_res: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub column_rotation: f64,
    pub y_res: f64,
}

impl GeoTransform {
    /// Build from the GeoTIFF ModelTiepoint `(i, j, k, x, y, z)` and
    /// ModelPixelScale `(sx, sy, sz)` tags.
    fn from_tiepoint(tiepoint: &[f64], scale: &[f64]) -> Option<Self> {
        if tiepoint.len() < 6 || scale.len() < 2 {
            return None;
        }
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        let (sx, sy) = (scale[0], scale[1]);
        Some(Self {
            origin_x: x - i * sx,
            x_res: sx,
            row_rotation: 0.0,
            origin_y: y + j * sy,
            column_rotation: 0.0,
            y_res: -sy,
        })
    }

    /// Build from the row-major 4x4 GeoTIFF ModelTransformation matrix.
    fn from_matrix(matrix: &[f64]) -> Option<Self> {
        if matrix.len() < 16 {
            return None;
        }
        Some(Self {
            origin_x: matrix[3],
            x_res: matrix[0],
            row_rotation: matrix[1],
            origin_y: matrix[7],
            column_rotation: matrix[4],
            y_res: matrix[5],
        })
    }

    /// Moves the origin from the centre of the top left pixel to its corner.
    fn shift_to_pixel_corner(self) -> Self {
        Self {
            origin_x: self.origin_x - 0.5 * (self.x_res + self.row_rotation),
            origin_y: self.origin_y - 0.5 * (self.column_rotation + self.y_res),
            ..self
        }
    }

    /// Extent of a `width` x `height` raster. Rotation terms are ignored.
    pub fn bbox(&self, width: u32, height: u32) -> Bbox {
        let left = self.origin_x;
        let top = self.origin_y;
        let right = left + f64::from(width) * self.x_res;
        let bottom = top + f64::from(height) * self.y_res;
        Bbox::new(left, bottom, right, top)
    }
}

/// Derive the bounding box of a GeoTIFF raster (e.g. a DEM) from its geotransform.
///
/// The box covers whole pixels. Rasters tagged `PixelIsPoint` (common for
/// SRTM and Copernicus DEMs) have their tiepoint at the pixel centre, so the
/// origin is shifted half a pixel up and left, as GDAL does.
pub fn bbox_from_raster(path: &Path) -> Result<Bbox, GeometryError> {
    let file = File::open(path).map_err(|source| GeometryError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let raster_err = |source: TiffError| GeometryError::Raster {
        path: path.to_path_buf(),
        source,
    };

    let mut decoder = Decoder::new(BufReader::new(file)).map_err(raster_err)?;
    let (width, height) = decoder.dimensions().map_err(raster_err)?;
    let transform = read_geotransform(&mut decoder)
        .map_err(raster_err)?
        .ok_or_else(|| GeometryError::NotGeoreferenced(path.to_path_buf()))?;
    debug!(?path, ?transform, width, height, "Read raster geotransform");

    Ok(transform.bbox(width, height))
}

/// Pixel-corner geotransform from the tiepoint/scale pair, falling back to
/// the transformation matrix.
fn read_geotransform<R: Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Result<Option<GeoTransform>, TiffError> {
    let tiepoint = read_f64_tag(decoder, Tag::ModelTiepointTag)?;
    let scale = read_f64_tag(decoder, Tag::ModelPixelScaleTag)?;
    let transform = match (tiepoint, scale) {
        (Some(tiepoint), Some(scale)) => GeoTransform::from_tiepoint(&tiepoint, &scale),
        _ => read_f64_tag(decoder, Tag::ModelTransformationTag)?
            .and_then(|m| GeoTransform::from_matrix(&m)),
    };
    let Some(transform) = transform else {
        return Ok(None);
    };

    if is_pixel_is_point(decoder)? {
        debug!("Raster is PixelIsPoint, shifting origin to the pixel corner");
        return Ok(Some(transform.shift_to_pixel_corner()));
    }
    Ok(Some(transform))
}

const GT_RASTER_TYPE_GEO_KEY: u32 = 1025;
const RASTER_PIXEL_IS_POINT: u32 = 2;

fn is_pixel_is_point<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<bool, TiffError> {
    let Some(directory) = decoder.find_tag(Tag::GeoKeyDirectoryTag)? else {
        return Ok(false);
    };
    let directory = directory.into_u32_vec()?;
    // 4 value header, then (key id, tag location, count, value) per key
    let keys = directory.get(4..).unwrap_or_default();
    Ok(keys.chunks_exact(4).any(|key| {
        key[0] == GT_RASTER_TYPE_GEO_KEY && key[1] == 0 && key[3] == RASTER_PIXEL_IS_POINT
    }))
}

fn read_f64_tag<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<Vec<f64>>, TiffError> {
    match decoder.find_tag(tag)? {
        Some(value) => Ok(Some(value.into_f64_vec()?)),
        None => Ok(None),
    }
}

/// Envelope of the geometry stored as Well-Known Text in `path`.
pub fn bbox_from_wkt(path: &Path) -> Result<Bbox, GeometryError> {
    let content = fs::read_to_string(path).map_err(|source| GeometryError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    bbox_from_wkt_str(content.trim()).map_err(|e| match e {
        WktFailure::Parse(message) => GeometryError::Wkt {
            path: path.to_path_buf(),
            message,
        },
        WktFailure::Empty => GeometryError::EmptyGeometry(path.to_path_buf()),
    })
}

enum WktFailure {
    Parse(String),
    Empty,
}

fn bbox_from_wkt_str(text: &str) -> Result<Bbox, WktFailure> {
    let geometry = geo::Geometry::<f64>::try_from_wkt_str(text)
        .map_err(|e| WktFailure::Parse(e.to_string()))?;
    let rect = geometry.bounding_rect().ok_or(WktFailure::Empty)?;
    let (min, max) = (rect.min(), rect.max());
    Ok(Bbox::new(min.x, min.y, max.x, max.y))
}

/// Writes a blank GeoTIFF anchored at `origin` (top left) with square pixels.
#[cfg(test)]
pub(crate) fn write_test_geotiff(path: &Path, width: u32, height: u32, origin: (f64, f64), res: f64) {
    write_geotiff_with_keys(path, width, height, origin, res, None);
}

#[cfg(test)]
fn write_geotiff_with_keys(
    path: &Path,
    width: u32,
    height: u32,
    origin: (f64, f64),
    res: f64,
    geo_keys: Option<&[u16]>,
) {
    use tiff::encoder::{colortype, TiffEncoder};

    let mut file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(&mut file).unwrap();
    let mut image = encoder
        .new_image::<colortype::Gray8>(width, height)
        .unwrap();
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[res, res, 0.0][..])
        .unwrap();
    image
        .encoder()
        .write_tag(
            Tag::ModelTiepointTag,
            &[0.0, 0.0, 0.0, origin.0, origin.1, 0.0][..],
        )
        .unwrap();
    if let Some(geo_keys) = geo_keys {
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, geo_keys)
            .unwrap();
    }
    let data = vec![0u8; (width * height) as usize];
    image.write_data(&data).unwrap();
}
