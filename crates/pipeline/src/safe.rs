//! Sentinel-2 `.SAFE` products
//!
//! A product directory such as
//! `S2B_MSIL2A_20190715T151809_N0213_R068_T22WDA_20190715T172254.SAFE` holds
//! one file per band and resolution somewhere below `GRANULE/*/IMG_DATA/`.

use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use lakemap_algorithms::imagery::ndwi;
use lakemap_core::io::{read_geotiff, read_geotiff_info, RasterInfo};
use lakemap_core::{Raster, CRS};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Green band at 10 m
pub const GREEN_BAND: &str = "B03_10m";
/// Near-infrared band at 10 m
pub const NIR_BAND: &str = "B08_10m";

/// Identity of a product parsed from its directory name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeId {
    /// Sensing date
    pub date: Option<NaiveDate>,
    /// MGRS tile, `TXXXX` when the name carries none
    pub tile: String,
    /// Directory name including `.SAFE`
    pub name: String,
}

impl SafeId {
    pub fn parse(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let date_re = Regex::new(r"_(\d{8})T")?;
        let tile_re = Regex::new(r"_(T\d{2}[A-Z]{3})_")?;

        let date = date_re
            .captures(&name)
            .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y%m%d").ok());
        let tile = tile_re
            .captures(&name)
            .map_or_else(|| "TXXXX".to_string(), |c| c[1].to_string());

        Ok(Self { date, tile, name })
    }

    /// `YYYY-MM-DD`, empty when unknown
    pub fn date_string(&self) -> String {
        self.date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
    }

    /// Output file prefix: `{date}_{tile}`, or the name without `.SAFE`
    pub fn tag(&self) -> String {
        match self.date {
            Some(_) => format!("{}_{}", self.date_string(), self.tile),
            None => self.name.replace(".SAFE", ""),
        }
    }
}

fn is_band_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jp2" | "tif" | "tiff"))
        .unwrap_or(false)
}

/// First band file (sorted recursive walk) whose name contains `band`
pub fn find_band_path(safe: &Path, band: &str) -> Result<PathBuf> {
    WalkDir::new(safe)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| is_band_file(p) && p.file_name().map_or(false, |n| n.to_string_lossy().contains(band)))
        .ok_or_else(|| PipelineError::BandNotFound {
            band: band.to_string(),
            safe: safe.to_path_buf(),
        })
}

/// Grid and no-data of a band
pub fn load_profile(safe: &Path, band: &str) -> Result<RasterInfo> {
    let path = find_band_path(safe, band)?;
    Ok(read_geotiff_info(&path)?)
}

/// CRS and EPSG code of a band
pub fn safe_crs(safe: &Path, band: &str) -> Result<(CRS, Option<u32>)> {
    let path = find_band_path(safe, band)?;
    raster_crs(&path)
}

/// CRS and EPSG code of a DEM raster
pub fn dem_crs(path: &Path) -> Result<(CRS, Option<u32>)> {
    raster_crs(path)
}

fn raster_crs(path: &Path) -> Result<(CRS, Option<u32>)> {
    let info = read_geotiff_info(path)?;
    let crs = info.grid.crs.ok_or_else(|| PipelineError::MissingCrs(path.to_path_buf()))?;
    let epsg = crs.epsg();
    Ok((crs, epsg))
}

/// Read a band as f32
pub fn load_band(path: &Path) -> Result<Raster<f32>> {
    Ok(read_geotiff::<f32, _>(path, None)?)
}

/// NDWI of a product from its 10 m green and NIR bands.
///
/// The result is georeferenced like the NIR band.
pub fn load_ndwi(safe: &Path) -> Result<Raster<f32>> {
    let green = load_band(&find_band_path(safe, GREEN_BAND)?)?;
    let nir = load_band(&find_band_path(safe, NIR_BAND)?)?;
    debug!(rows = nir.rows(), cols = nir.cols(), "computing NDWI");
    let green_nodata = green.nodata();
    let mut green = nir.with_data(green.into_array())?;
    green.set_nodata(green_nodata);
    Ok(ndwi(&green, &nir)?)
}
