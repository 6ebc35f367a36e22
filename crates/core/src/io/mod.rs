//! I/O for rasters (GeoTIFF natively, everything GDAL opens with the
//! `gdal` feature) and vector feature collections.

#[cfg(feature = "gdal")]
mod gdal_io;
mod native;
mod vector;

use crate::error::{Error, Result};
use crate::raster::GridSpec;
use std::path::Path;

#[cfg(feature = "gdal")]
pub use gdal_io::{read_geotiff, read_geotiff_info, write_geotiff};

#[cfg(not(feature = "gdal"))]
pub use native::{read_geotiff, read_geotiff_info, write_geotiff};

pub use vector::{read_geojson, write_geojson, write_vector, VectorFormat};

/// Compression applied to written rasters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Deflate,
}

/// Options for writing GeoTIFF files
#[derive(Debug, Clone, Default)]
pub struct GeoTiffOptions {
    pub compression: Compression,
}

/// Raster metadata read without the pixel data
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub grid: GridSpec,
    pub nodata: Option<f64>,
}

/// Whether the native reader can open this path
pub fn is_native_format(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "tif" | "tiff"))
        .unwrap_or(false)
}

pub(crate) fn ensure_native_format(path: &Path) -> Result<()> {
    if is_native_format(path) {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat(path.display().to_string()))
    }
}
