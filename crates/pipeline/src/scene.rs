//! Per-scene processing: NDWI, DEM filter and lake vectors

use crate::config::PipelineConfig;
use crate::dem::{load_dem, DemCache, DemSource};
use crate::error::{PipelineError, Result};
use crate::safe::{find_band_path, load_ndwi, load_profile, safe_crs, SafeId, GREEN_BAND};
use geo_types::Geometry;
use lakemap_algorithms::imagery::{count_ones, lake_mask, threshold_above};
use lakemap_algorithms::vector::{filter_by_area, metric_crs_for, polygonize};
use lakemap_algorithms::warp::{reproject_to_grid, ReprojectParams};
use lakemap_core::geometry::{bounds_overlap, overlap_ratio};
use lakemap_core::io::{write_geotiff, write_vector, GeoTiffOptions};
use lakemap_core::vector::{Feature, FeatureCollection};
use lakemap_core::Raster;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Why a scene produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The DEM envelope does not reach the scene
    NoDemCoverage,
}

/// Files written for one scene
#[derive(Debug, Clone, PartialEq)]
pub struct SceneProducts {
    pub tag: String,
    pub ndwi_mask: PathBuf,
    pub ndwi: Option<PathBuf>,
    pub lake_mask: PathBuf,
    /// Absent when no polygon survived the area filter
    pub lakes: Option<PathBuf>,
    pub water_pixels: usize,
    pub lake_pixels: usize,
    pub lake_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneOutcome {
    Processed(SceneProducts),
    Skipped { tag: String, reason: SkipReason },
}

fn write_mask(mask: &Raster<u8>, path: &Path) -> Result<()> {
    write_geotiff(mask, path, Some(GeoTiffOptions::default()))?;
    Ok(())
}

/// Run the full chain on one `.SAFE` product, writing into `out_root`.
pub fn process_safe(safe: &Path, dem: &DemSource, out_root: &Path, cfg: &PipelineConfig) -> Result<SceneOutcome> {
    std::fs::create_dir_all(out_root)?;
    let id = SafeId::parse(safe)?;
    let tag = id.tag();

    let (s2_crs, s2_epsg) = safe_crs(safe, GREEN_BAND)?;
    let profile = load_profile(safe, GREEN_BAND)?;
    let s2_bounds = profile.grid.bounds();
    info!(epsg = ?s2_epsg, bounds = %s2_bounds, "{tag}: Sentinel grid");

    let dem_bounds = dem.bounds_in(&s2_crs)?;
    if !bounds_overlap(&dem_bounds, &s2_bounds) {
        warn!("{tag}: DEM does not cover the scene, skipping");
        return Ok(SceneOutcome::Skipped {
            tag,
            reason: SkipReason::NoDemCoverage,
        });
    }
    info!("{tag}: DEM-Sentinel overlap ratio {:.3}", overlap_ratio(&dem_bounds, &s2_bounds));

    let band_path = find_band_path(safe, GREEN_BAND)?;
    let clipped_dem = DemCache::new(out_root).align(
        &id.tile,
        dem,
        &band_path,
        cfg.reuse_dem_cache,
        &cfg.dem_params(),
    )?;

    let ndwi = load_ndwi(safe)?;
    let water = threshold_above(&ndwi, cfg.ndwi_threshold);
    let ndwi_mask_path = out_root.join(format!("{tag}{}", cfg.ndwi_mask_suffix()));
    write_mask(&water, &ndwi_mask_path)?;
    info!(path = %ndwi_mask_path.display(), "raw NDWI mask saved");

    let ndwi_path = if cfg.write_ndwi {
        let path = out_root.join(format!("{tag}_ndwi.tif"));
        write_geotiff(&ndwi, &path, Some(GeoTiffOptions::default()))?;
        Some(path)
    } else {
        None
    };

    let dem_raster = load_dem(&clipped_dem)?.nodata_to_nan();
    let dem_grid = dem_raster.grid();
    let water = if water.grid().same_grid(&dem_grid) {
        water
    } else {
        info!("{tag}: resampling NDWI mask onto the DEM grid");
        let mut m = reproject_to_grid(&water, &dem_grid, &ReprojectParams::nearest(0.0))?;
        m.set_nodata(Some(0));
        m
    };

    let lakes_raster = lake_mask(&water, &dem_raster, cfg.elev_min)?;
    let lake_mask_path = out_root.join(format!("{tag}{}", cfg.lake_mask_suffix()));
    write_mask(&lakes_raster, &lake_mask_path)?;
    info!(path = %lake_mask_path.display(), "supraglacial lake mask saved");

    let water_pixels = count_ones(&water);
    let lake_pixels = count_ones(&lakes_raster);
    let (lakes, lake_count) = write_lake_vectors(&lakes_raster, &id, out_root, &tag, cfg)?;
    match &lakes {
        Some(p) => info!(lakes = lake_count, "vector lakes written to {}", p.display()),
        None => warn!("{tag}: no vector output created"),
    }

    Ok(SceneOutcome::Processed(SceneProducts {
        tag,
        ndwi_mask: ndwi_mask_path,
        ndwi: ndwi_path,
        lake_mask: lake_mask_path,
        lakes,
        water_pixels,
        lake_pixels,
        lake_count,
    }))
}

/// Polygonize the lake mask, filter by area and write the attributed features.
///
/// Returns the written path (if any) and the number of features.
fn write_lake_vectors(
    mask: &Raster<u8>,
    id: &SafeId,
    out_root: &Path,
    tag: &str,
    cfg: &PipelineConfig,
) -> Result<(Option<PathBuf>, usize)> {
    let polygons = polygonize(mask, 1);
    if polygons.is_empty() {
        warn!("{tag}: no polygons found after thresholding");
        return Ok((None, 0));
    }

    let src_crs = mask.crs().ok_or_else(|| PipelineError::MissingCrs(out_root.join(tag)))?;
    let area_crs = match cfg.area_crs()? {
        Some(c) => c,
        None => metric_crs_for(src_crs, &mask.bounds())?,
    };

    let kept = filter_by_area(polygons, Some(src_crs), &area_crs, cfg.min_area_m2)?;
    if kept.is_empty() {
        warn!("{tag}: all polygons filtered out by min area");
        return Ok((None, 0));
    }

    let date = id.date_string();
    let mut fc = FeatureCollection::new(Some(area_crs));
    for (polygon, area) in kept {
        fc.push(
            Feature::new(Geometry::Polygon(polygon))
                .with_property("area_m2", area)
                .with_property("safe_name", id.name.as_str())
                .with_property("date", date.as_str())
                .with_property("ndwi_thr", cfg.ndwi_threshold)
                .with_property("elev_min_m", cfg.elev_min),
        );
    }

    let path = out_root.join(format!("{tag}_lakes.{}", cfg.vector_format.extension()));
    write_vector(&fc, &path)?;
    Ok((Some(path), fc.len()))
}

/// `.SAFE` directories below `root` matching `pattern`, sorted
pub fn find_safe_dirs(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", glob::Pattern::escape(&root.to_string_lossy()), pattern);
    let mut dirs: Vec<PathBuf> = glob::glob(&full)?
        .filter_map(|e| e.ok())
        .filter(|p| p.is_dir() && p.to_string_lossy().ends_with(".SAFE"))
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Counts of a batch run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    /// Scene name and error message
    pub failed: Vec<(String, String)>,
}

/// Process scenes in order. A failing scene is logged and counted; the rest
/// still run. `on_done` is called with each scene name once it finishes.
pub fn process_batch<F>(
    safes: &[PathBuf],
    dem: &DemSource,
    out_root: &Path,
    cfg: &PipelineConfig,
    mut on_done: F,
) -> BatchSummary
where
    F: FnMut(&str),
{
    let mut summary = BatchSummary::default();
    let n = safes.len();
    for (i, safe) in safes.iter().enumerate() {
        let name = safe
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| safe.display().to_string());
        info!("[{}/{}] {}", i + 1, n, name);

        match process_safe(safe, dem, out_root, cfg) {
            Ok(SceneOutcome::Processed(_)) => summary.processed += 1,
            Ok(SceneOutcome::Skipped { .. }) => summary.skipped += 1,
            Err(e) => {
                warn!("{name} failed: {e}");
                summary.failed.push((name.clone(), e.to_string()));
            }
        }
        on_done(&name);
    }
    summary
}
