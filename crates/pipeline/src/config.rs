//! Run configuration
//!
//! Every struct deserializes from partial JSON; missing keys take the
//! defaults below.

use crate::error::{PipelineError, Result};
use lakemap_algorithms::warp::{ReprojectParams, Resampling};
use lakemap_core::io::VectorFormat;
use lakemap_core::CRS;
use lakemap_parallel::ProcessingMode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Thresholds and outputs of per-scene processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Water where NDWI is strictly above this
    pub ndwi_threshold: f64,
    /// Lakes must lie strictly above this elevation (m)
    pub elev_min: f64,
    /// Polygons smaller than this (m²) are dropped
    pub min_area_m2: f64,
    pub vector_format: VectorFormat,
    /// CRS areas are measured in, e.g. `EPSG:32622`. Chosen from the scene when unset.
    pub area_crs: Option<String>,
    pub dem_resampling: Resampling,
    pub dem_nodata: f64,
    /// Also write the continuous NDWI raster
    pub write_ndwi: bool,
    /// Reuse aligned DEM rasters from earlier runs when they match the scene grid
    pub reuse_dem_cache: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ndwi_threshold: 0.25,
            elev_min: 0.0,
            min_area_m2: 1000.0,
            vector_format: VectorFormat::GeoJson,
            area_crs: None,
            dem_resampling: Resampling::Bilinear,
            dem_nodata: -9999.0,
            write_ndwi: true,
            reuse_dem_cache: true,
        }
    }
}

impl PipelineConfig {
    /// File suffix of the thresholded NDWI mask, e.g. `_ndwi_0.25.tif`
    pub fn ndwi_mask_suffix(&self) -> String {
        format!("_ndwi_{:.2}.tif", self.ndwi_threshold)
    }

    /// File suffix of the lake mask, e.g. `_lake_ndwi0.25_dem0.tif`
    pub fn lake_mask_suffix(&self) -> String {
        format!("_lake_ndwi{:.2}_dem{}.tif", self.ndwi_threshold, self.elev_min.trunc() as i64)
    }

    pub fn area_crs(&self) -> Result<Option<CRS>> {
        self.area_crs
            .as_deref()
            .map(|s| s.parse::<CRS>().map_err(PipelineError::from))
            .transpose()
    }

    pub fn dem_params(&self) -> ReprojectParams {
        ReprojectParams {
            resampling: self.dem_resampling,
            src_nodata: None,
            dst_nodata: self.dem_nodata,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ndwi_threshold.is_finite() || !(-1.0..=1.0).contains(&self.ndwi_threshold) {
            return Err(PipelineError::Config(format!(
                "ndwi_threshold must lie in [-1, 1], got {}",
                self.ndwi_threshold
            )));
        }
        if !self.min_area_m2.is_finite() || self.min_area_m2 < 0.0 {
            return Err(PipelineError::Config(format!("min_area_m2 must be >= 0, got {}", self.min_area_m2)));
        }
        self.area_crs()?;
        Ok(())
    }
}

/// Sliding-window export of training tiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_size: usize,
    pub stride: usize,
    /// Keep windows whose mask has no lake pixel
    pub keep_empty: bool,
    /// Overrides the image suffix derived from [`PipelineConfig`]
    pub image_suffix: Option<String>,
    /// Overrides the lake-mask suffix derived from [`PipelineConfig`]
    pub lake_suffix: Option<String>,
    pub mode: ProcessingMode,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            stride: 128,
            keep_empty: false,
            image_suffix: None,
            lake_suffix: None,
            mode: ProcessingMode::Parallel,
        }
    }
}

impl TilingConfig {
    /// (image suffix, lake suffix)
    pub fn suffixes(&self, pipeline: &PipelineConfig) -> (String, String) {
        (
            self.image_suffix.clone().unwrap_or_else(|| pipeline.ndwi_mask_suffix()),
            self.lake_suffix.clone().unwrap_or_else(|| pipeline.lake_mask_suffix()),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.stride == 0 {
            return Err(PipelineError::Config("tile_size and stride must be positive".into()));
        }
        Ok(())
    }
}

/// ArcticDEM strip resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DemResolution {
    #[serde(rename = "2m")]
    TwoMetre,
    #[default]
    #[serde(rename = "10m")]
    TenMetre,
}

impl DemResolution {
    pub fn token(self) -> &'static str {
        match self {
            DemResolution::TwoMetre => "2m",
            DemResolution::TenMetre => "10m",
        }
    }

    pub fn other(self) -> Self {
        match self {
            DemResolution::TwoMetre => DemResolution::TenMetre,
            DemResolution::TenMetre => DemResolution::TwoMetre,
        }
    }
}

impl std::str::FromStr for DemResolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2m" => Ok(DemResolution::TwoMetre),
            "10m" => Ok(DemResolution::TenMetre),
            other => Err(PipelineError::Config(format!("resolution must be 2m or 10m, got {other}"))),
        }
    }
}

impl std::fmt::Display for DemResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Selection of ArcticDEM strips over a scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripSelectionConfig {
    /// CRS of the scene bounds
    pub sentinel_crs: String,
    /// Buffer around the scene bounds (m)
    pub buffer_m: f64,
    pub resolution: DemResolution,
    /// Strips kept after ranking; at least one is always kept
    pub max_strips: usize,
}

impl Default for StripSelectionConfig {
    fn default() -> Self {
        Self {
            sentinel_crs: "EPSG:32622".into(),
            buffer_m: 1000.0,
            resolution: DemResolution::TenMetre,
            max_strips: 10,
        }
    }
}

impl StripSelectionConfig {
    pub fn crs(&self) -> Result<CRS> {
        Ok(self.sentinel_crs.parse::<CRS>()?)
    }
}

/// Deserialize a JSON file
pub fn from_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&text)?)
}
