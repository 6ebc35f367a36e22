//! ArcticDEM sources and their alignment onto Sentinel-2 grids

use crate::error::{PipelineError, Result};
use lakemap_algorithms::clip::clip_to_bounds;
use lakemap_algorithms::warp::{reproject_mosaic, ReprojectParams};
use lakemap_core::crs::{transform_bounds, DEFAULT_DENSIFY_PTS};
use lakemap_core::io::{read_geotiff, read_geotiff_info, write_geotiff, GeoTiffOptions, RasterInfo};
use lakemap_core::{Bounds, Error, GridSpec, Raster, CRS};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Elevation data covering one or more scenes
#[derive(Debug, Clone, PartialEq)]
pub enum DemSource {
    /// A single raster
    File(PathBuf),
    /// Strip tiles mosaicked on the fly
    Tiles(Vec<PathBuf>),
}

impl DemSource {
    /// A file is used as is. A directory contributes its `*_dem.tif`
    /// rasters, or every `*.tif` when it holds none.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Ok(DemSource::File(path.to_path_buf()));
        }
        let dir = glob::Pattern::escape(&path.to_string_lossy());
        let mut tiles = collect_glob(&format!("{dir}/*_dem.tif"))?;
        if tiles.is_empty() {
            tiles = collect_glob(&format!("{dir}/*.tif"))?;
        }
        if tiles.is_empty() {
            return Err(PipelineError::EmptyDemSource(path.to_path_buf()));
        }
        debug!(tiles = tiles.len(), dir = %path.display(), "DEM tile set");
        Ok(DemSource::Tiles(tiles))
    }

    pub fn paths(&self) -> &[PathBuf] {
        match self {
            DemSource::File(p) => std::slice::from_ref(p),
            DemSource::Tiles(v) => v,
        }
    }

    pub fn infos(&self) -> Result<Vec<RasterInfo>> {
        self.paths()
            .iter()
            .map(|p| read_geotiff_info(p).map_err(PipelineError::from))
            .collect()
    }

    /// Union of the source envelopes expressed in `crs`
    pub fn bounds_in(&self, crs: &CRS) -> Result<Bounds> {
        let mut union: Option<Bounds> = None;
        for (path, info) in self.paths().iter().zip(self.infos()?) {
            let src = info.grid.crs.as_ref().ok_or_else(|| PipelineError::MissingCrs(path.clone()))?;
            let b = transform_bounds(src, crs, &info.grid.bounds(), DEFAULT_DENSIFY_PTS)?;
            union = Some(match union {
                Some(u) => u.union(&b),
                None => b,
            });
        }
        union.ok_or_else(|| PipelineError::EmptyDemSource(PathBuf::new()))
    }

    /// All rasters of the source as f32
    pub fn load(&self) -> Result<Vec<Raster<f32>>> {
        self.paths().iter().map(|p| load_dem(p)).collect()
    }
}

fn collect_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|e| e.ok()).filter(|p| p.is_file()).collect();
    out.sort();
    Ok(out)
}

/// Read a DEM as f32
pub fn load_dem(path: &Path) -> Result<Raster<f32>> {
    Ok(read_geotiff::<f32, _>(path, None)?)
}

fn write_f32(raster: &Raster<f32>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_geotiff(raster, path, Some(GeoTiffOptions::default()))?;
    Ok(())
}

/// Resample the DEM onto `grid`.
///
/// The result is f32 with `params.dst_nodata` as no-data and is also written
/// as a DEFLATE GeoTIFF when `out_path` is given.
pub fn reproject_dem_to_grid(
    dem: &DemSource,
    grid: &GridSpec,
    out_path: Option<&Path>,
    params: &ReprojectParams,
) -> Result<Raster<f32>> {
    let sources = dem.load()?;
    let mut out = reproject_mosaic(&sources, grid, params)?;
    out.set_nodata(Some(params.dst_nodata as f32));
    if let Some(path) = out_path {
        write_f32(&out, path)?;
        debug!(path = %path.display(), "aligned DEM written");
    }
    Ok(out)
}

/// Clip `src_path` to the envelope of `ref_path`. Both must share a CRS.
pub fn clip_to_ref_bounds(src_path: &Path, ref_path: &Path, out_path: &Path) -> Result<Raster<f32>> {
    let reference = read_geotiff_info(ref_path)?;
    let src = load_dem(src_path)?;

    match (src.crs(), reference.grid.crs.as_ref()) {
        (Some(a), Some(b)) if !a.is_equivalent(b) => {
            return Err(Error::CrsMismatch(a.identifier(), b.identifier()).into());
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(Error::CrsMismatch(
                src.crs().map_or_else(|| "none".into(), CRS::identifier),
                reference.grid.crs.as_ref().map_or_else(|| "none".into(), CRS::identifier),
            )
            .into());
        }
        _ => {}
    }

    let clipped = clip_to_bounds(&src, &reference.grid.bounds())?;
    write_f32(&clipped, out_path)?;
    Ok(clipped)
}

/// Paths written by [`align_dem_to_sentinel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedDem {
    pub aligned: PathBuf,
    pub clipped: Option<PathBuf>,
}

/// Resample the DEM onto the grid of a Sentinel-2 band and optionally clip it
/// to the band footprint.
pub fn align_dem_to_sentinel(
    dem: &DemSource,
    sentinel_band: &Path,
    out_aligned: &Path,
    out_clipped: Option<&Path>,
    params: &ReprojectParams,
) -> Result<AlignedDem> {
    let reference = read_geotiff_info(sentinel_band)?;
    reproject_dem_to_grid(dem, &reference.grid, Some(out_aligned), params)?;

    let clipped = match out_clipped {
        Some(path) => {
            clip_to_ref_bounds(out_aligned, sentinel_band, path)?;
            Some(path.to_path_buf())
        }
        None => None,
    };
    Ok(AlignedDem {
        aligned: out_aligned.to_path_buf(),
        clipped,
    })
}

/// Aligned DEM rasters kept between runs, one pair per MGRS tile
#[derive(Debug, Clone)]
pub struct DemCache {
    dir: PathBuf,
}

impl DemCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn aligned_path(&self, tile: &str) -> PathBuf {
        self.dir.join(format!("dem_to_sentinel_{tile}.tif"))
    }

    pub fn clipped_path(&self, tile: &str) -> PathBuf {
        self.dir.join(format!("dem_to_sentinel_{tile}_clipped.tif"))
    }

    /// Whether both cached rasters exist and the clipped one lies on `grid`
    pub fn is_fresh(&self, tile: &str, grid: &GridSpec) -> bool {
        let aligned = self.aligned_path(tile);
        let clipped = self.clipped_path(tile);
        if !aligned.is_file() || !clipped.is_file() {
            return false;
        }
        match read_geotiff_info(&clipped) {
            Ok(info) => info.grid.same_grid(grid),
            Err(e) => {
                debug!(path = %clipped.display(), "unreadable cached DEM: {e}");
                false
            }
        }
    }

    /// Path of a clipped DEM on the band grid, aligning it unless a fresh
    /// cached copy exists and `reuse` is set.
    pub fn align(
        &self,
        tile: &str,
        dem: &DemSource,
        sentinel_band: &Path,
        reuse: bool,
        params: &ReprojectParams,
    ) -> Result<PathBuf> {
        let grid = read_geotiff_info(sentinel_band)?.grid;
        if reuse && self.is_fresh(tile, &grid) {
            info!(tile, "reusing aligned DEM");
            return Ok(self.clipped_path(tile));
        }

        info!(tile, "aligning DEM to Sentinel grid");
        let clipped = self.clipped_path(tile);
        align_dem_to_sentinel(dem, sentinel_band, &self.aligned_path(tile), Some(&clipped), params)?;
        Ok(clipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use lakemap_core::GeoTransform;
    use tempfile::TempDir;

    fn utm() -> CRS {
        CRS::from_epsg(32622)
    }

    fn write_dem(path: &Path, origin: (f64, f64), size: usize, res: f64, value: f32) {
        let mut r = Raster::filled(size, size, value);
        r.set_transform(GeoTransform::new(origin.0, origin.1, res, -res));
        r.set_crs(Some(utm()));
        r.set_nodata(Some(-9999.0));
        write_geotiff(&r, path, None).unwrap();
    }

    #[test]
    fn directory_prefers_dem_tiles() {
        let tmp = TempDir::new().unwrap();
        write_dem(&tmp.path().join("b_dem.tif"), (0.0, 100.0), 10, 10.0, 1.0);
        write_dem(&tmp.path().join("a_dem.tif"), (100.0, 100.0), 10, 10.0, 2.0);
        write_dem(&tmp.path().join("a_matchtag.tif"), (0.0, 100.0), 10, 10.0, 0.0);

        let src = DemSource::open(tmp.path()).unwrap();
        let names: Vec<_> = src.paths().iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["a_dem.tif", "b_dem.tif"]);

        let b = src.bounds_in(&utm()).unwrap();
        assert_relative_eq!(b.min_x, 0.0);
        assert_relative_eq!(b.max_x, 200.0);
    }

    #[test]
    fn empty_directory_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(DemSource::open(tmp.path()), Err(PipelineError::EmptyDemSource(_))));
    }

    #[test]
    fn mosaic_onto_grid() {
        let tmp = TempDir::new().unwrap();
        write_dem(&tmp.path().join("w_dem.tif"), (0.0, 100.0), 10, 10.0, 100.0);
        write_dem(&tmp.path().join("x_dem.tif"), (100.0, 100.0), 10, 10.0, 200.0);
        let src = DemSource::open(tmp.path()).unwrap();

        let grid = GridSpec::new(Some(utm()), GeoTransform::new(50.0, 100.0, 20.0, -20.0), 5, 10);
        let out_path = tmp.path().join("out/aligned.tif");
        let out = reproject_dem_to_grid(&src, &grid, Some(&out_path), &ReprojectParams::nearest(-9999.0)).unwrap();

        assert!(out_path.is_file());
        assert_relative_eq!(out.get(0, 0).unwrap(), 100.0);
        assert_relative_eq!(out.get(0, 4).unwrap(), 200.0);
        // beyond x = 200 nothing covers the grid
        assert_relative_eq!(out.get(0, 9).unwrap(), -9999.0);
    }

    #[test]
    fn clip_rejects_foreign_crs() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.tif");
        write_dem(&src, (0.0, 100.0), 10, 10.0, 5.0);

        let mut r = Raster::filled(4, 4, 0u8);
        r.set_transform(GeoTransform::new(0.0, 100.0, 10.0, -10.0));
        r.set_crs(Some(CRS::from_epsg(3413)));
        let reference = tmp.path().join("ref.tif");
        write_geotiff(&r, &reference, None).unwrap();

        let err = clip_to_ref_bounds(&src, &reference, &tmp.path().join("c.tif")).unwrap_err();
        assert!(matches!(err, PipelineError::Core(Error::CrsMismatch(..))));
    }

    #[test]
    fn cache_reused_only_on_matching_grid() {
        let tmp = TempDir::new().unwrap();
        let dem = tmp.path().join("dem.tif");
        write_dem(&dem, (0.0, 200.0), 20, 10.0, 50.0);

        let mut band = Raster::filled(8, 8, 1u16);
        band.set_transform(GeoTransform::new(20.0, 180.0, 10.0, -10.0));
        band.set_crs(Some(utm()));
        let band_path = tmp.path().join("B03_10m.tif");
        write_geotiff(&band, &band_path, None).unwrap();

        let cache = DemCache::new(tmp.path().join("cache"));
        let src = DemSource::open(&dem).unwrap();
        let clipped = cache.align("T22WDA", &src, &band_path, true, &ReprojectParams::default()).unwrap();
        assert_eq!(clipped, cache.clipped_path("T22WDA"));
        assert!(cache.is_fresh("T22WDA", &band.grid()));

        let mut shifted = band.grid();
        shifted.transform = shifted.transform.shifted(1, 0);
        assert!(!cache.is_fresh("T22WDA", &shifted));
        assert!(!cache.is_fresh("T21XVD", &band.grid()));

        let dem_on_band = load_dem(&clipped).unwrap();
        assert_eq!(dem_on_band.shape(), (8, 8));
        assert_relative_eq!(dem_on_band.get(4, 4).unwrap(), 50.0);
    }
}
