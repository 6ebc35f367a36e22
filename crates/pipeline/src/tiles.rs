//! Training tiles: sliding windows over (NDWI, lake mask) raster pairs,
//! stored as compressed `.npz` files, plus a consistency report over the
//! written tiles.

use crate::config::{PipelineConfig, TilingConfig};
use crate::error::Result;
use lakemap_algorithms::imagery::clip_values;
use lakemap_core::io::read_geotiff;
use lakemap_core::Raster;
use lakemap_parallel::{ParallelStrategy, SlidingWindows};
use ndarray::{ArrayD, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// An image raster and its lake mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePair {
    pub image: PathBuf,
    pub lake: PathBuf,
    /// File name with the image suffix removed; prefix of every tile name
    pub base: String,
}

/// Counts for one tiled pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStats {
    pub written: usize,
    /// Windows with no lake pixel, kept or not
    pub empty_seen: usize,
}

impl std::ops::Add for TileStats {
    type Output = TileStats;

    fn add(self, rhs: TileStats) -> TileStats {
        TileStats {
            written: self.written + rhs.written,
            empty_seen: self.empty_seen + rhs.empty_seen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TilingSummary {
    pub pairs: usize,
    pub stats: TileStats,
    pub images_dir: PathBuf,
    pub masks_dir: PathBuf,
}

/// Image rasters in `in_dir` ending in `image_suffix` with a lake mask
/// `{base}{lake_suffix}` next to them. Images without a mask are skipped.
pub fn find_pairs(in_dir: &Path, image_suffix: &str, lake_suffix: &str) -> Result<Vec<TilePair>> {
    let pattern = format!(
        "{}/*{}",
        glob::Pattern::escape(&in_dir.to_string_lossy()),
        glob::Pattern::escape(image_suffix)
    );
    let mut images: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(|e| e.ok()).collect();
    images.sort();

    let mut pairs = Vec::new();
    for image in images {
        let name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let base = name.strip_suffix(image_suffix).unwrap_or(&name).to_string();
        let lake = in_dir.join(format!("{base}{lake_suffix}"));
        if lake.is_file() {
            pairs.push(TilePair { image, lake, base });
        } else {
            warn!("no lake mask for {}, expected {}", image.display(), lake.display());
        }
    }
    info!("found {} image/lake pairs", pairs.len());
    Ok(pairs)
}

/// Cut one pair into windows and write them as `{base}_y{row}_x{col}.npz`.
///
/// The image goes to `ndwi` with shape (1, H, W) as f32 clipped to [-1, 1];
/// the mask goes to `mask` with shape (H, W) as u8. Pairs whose grids differ
/// are skipped with a warning.
pub fn tile_pair(pair: &TilePair, out_img_dir: &Path, out_mask_dir: &Path, cfg: &TilingConfig) -> Result<TileStats> {
    let image: Raster<f32> = read_geotiff(&pair.image, None)?;
    let mask: Raster<u8> = read_geotiff(&pair.lake, None)?;

    if image.shape() != mask.shape() || !image.transform().approx_eq(mask.transform(), 1e-9) {
        warn!(
            "shape/transform mismatch, skipping:\n  {}\n  {}",
            pair.image.display(),
            pair.lake.display()
        );
        return Ok(TileStats::default());
    }

    let image = clip_values(&image, -1.0, 1.0);
    let (rows, cols) = image.shape();
    let mut stats = TileStats::default();

    for tile in SlidingWindows::new(rows, cols, cfg.tile_size, cfg.stride) {
        let mask_tile = tile.view(&mask);
        if mask_tile.iter().all(|&v| v == 0) {
            stats.empty_seen += 1;
            if !cfg.keep_empty {
                continue;
            }
        }
        let image_tile = tile.view(&image).insert_axis(Axis(0)).to_owned();
        let mask_tile = mask_tile.to_owned();

        let name = format!("{}_y{}_x{}.npz", pair.base, tile.row_offset, tile.col_offset);

        let mut npz = NpzWriter::new_compressed(File::create(out_img_dir.join(&name))?);
        npz.add_array("ndwi", &image_tile)?;
        npz.finish()?;

        let mut npz = NpzWriter::new_compressed(File::create(out_mask_dir.join(&name))?);
        npz.add_array("mask", &mask_tile)?;
        npz.finish()?;

        stats.written += 1;
    }

    info!(
        "tiled {}: {} tiles (empty tiles seen: {})",
        pair.base, stats.written, stats.empty_seen
    );
    Ok(stats)
}

/// Tile every pair found in `in_dir` into `out_root/images` and `out_root/masks`
pub fn make_tiles(
    in_dir: &Path,
    out_root: &Path,
    tiling: &TilingConfig,
    pipeline: &PipelineConfig,
) -> Result<TilingSummary> {
    tiling.validate()?;
    let images_dir = out_root.join("images");
    let masks_dir = out_root.join("masks");
    std::fs::create_dir_all(&images_dir)?;
    std::fs::create_dir_all(&masks_dir)?;

    let (image_suffix, lake_suffix) = tiling.suffixes(pipeline);
    let pairs = find_pairs(in_dir, &image_suffix, &lake_suffix)?;

    let results = tiling
        .mode
        .par_map(0..pairs.len(), |i| tile_pair(&pairs[i], &images_dir, &masks_dir, tiling));
    let mut stats = TileStats::default();
    for r in results {
        stats = stats + r?;
    }

    info!("total tiles written: {}", stats.written);
    Ok(TilingSummary {
        pairs: pairs.len(),
        stats,
        images_dir,
        masks_dir,
    })
}

/// First array of an `.npz` file, in whichever element type it was stored
#[derive(Debug, Clone, PartialEq)]
pub enum NpzArray {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    U8(ArrayD<u8>),
    I64(ArrayD<i64>),
}

impl NpzArray {
    pub fn read_first(path: &Path) -> Result<Self> {
        macro_rules! attempt {
            ($t:ty, $variant:ident) => {
                let mut npz = NpzReader::new(File::open(path)?)?;
                if let Ok(a) = npz.by_index::<ndarray::OwnedRepr<$t>, ndarray::IxDyn>(0) {
                    return Ok(NpzArray::$variant(a));
                }
            };
        }
        attempt!(f32, F32);
        attempt!(u8, U8);
        attempt!(f64, F64);
        let mut npz = NpzReader::new(File::open(path)?)?;
        Ok(NpzArray::I64(npz.by_index(0)?))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            NpzArray::F32(a) => a.shape(),
            NpzArray::F64(a) => a.shape(),
            NpzArray::U8(a) => a.shape(),
            NpzArray::I64(a) => a.shape(),
        }
    }

    /// numpy dtype name
    pub fn dtype(&self) -> &'static str {
        match self {
            NpzArray::F32(_) => "float32",
            NpzArray::F64(_) => "float64",
            NpzArray::U8(_) => "uint8",
            NpzArray::I64(_) => "int64",
        }
    }

    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            NpzArray::F32(a) => a.mapv(f64::from),
            NpzArray::F64(a) => a.clone(),
            NpzArray::U8(a) => a.mapv(f64::from),
            NpzArray::I64(a) => a.mapv(|v| v as f64),
        }
    }
}

/// Shapes and types of one image/mask tile pair
#[derive(Debug, Clone)]
pub struct SampleInspection {
    pub image: PathBuf,
    pub mask: PathBuf,
    pub image_shape: Vec<usize>,
    pub mask_shape: Vec<usize>,
    pub image_dtype: &'static str,
    pub mask_dtype: &'static str,
    /// Trailing (H, W) dimensions agree
    pub dims_match: bool,
    /// Sorted distinct mask values, at most ten
    pub unique_mask_values: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct TileReport {
    pub image_count: usize,
    pub mask_count: usize,
    /// Image stems without a mask, at most ten
    pub missing_masks: Vec<String>,
    /// Mask stems without an image, at most ten
    pub missing_images: Vec<String>,
    pub sample: Option<SampleInspection>,
}

impl TileReport {
    pub fn all_paired(&self) -> bool {
        self.missing_masks.is_empty() && self.missing_images.is_empty()
    }
}

fn npz_stems(dir: &Path) -> Result<BTreeSet<String>> {
    let pattern = format!("{}/*.npz", glob::Pattern::escape(&dir.to_string_lossy()));
    Ok(glob::glob(&pattern)?
        .filter_map(|e| e.ok())
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect())
}

/// Check that image and mask tiles pair up by stem and inspect the first pair
pub fn inspect_tiles(images_dir: &Path, masks_dir: &Path) -> Result<TileReport> {
    let images = npz_stems(images_dir)?;
    let masks = npz_stems(masks_dir)?;

    let mut report = TileReport {
        image_count: images.len(),
        mask_count: masks.len(),
        missing_masks: images.difference(&masks).take(10).cloned().collect(),
        missing_images: masks.difference(&images).take(10).cloned().collect(),
        sample: None,
    };
    if images.is_empty() {
        warn!("no image tiles found in {}", images_dir.display());
        return Ok(report);
    }
    if masks.is_empty() {
        warn!("no mask tiles found in {}", masks_dir.display());
        return Ok(report);
    }

    let Some(stem) = images.iter().next() else {
        return Ok(report);
    };
    let image = images_dir.join(format!("{stem}.npz"));
    let mask = masks_dir.join(format!("{stem}.npz"));
    if !mask.is_file() {
        return Ok(report);
    }

    let img = NpzArray::read_first(&image)?;
    let msk = NpzArray::read_first(&mask)?;
    let trailing = |s: &[usize]| s[s.len().saturating_sub(2)..].to_vec();

    let mut unique: Vec<f64> = msk.to_f64().iter().copied().filter(|v| !v.is_nan()).collect();
    unique.sort_by(|a, b| a.total_cmp(b));
    unique.dedup();
    unique.truncate(10);

    report.sample = Some(SampleInspection {
        dims_match: trailing(img.shape()) == trailing(msk.shape()),
        image_shape: img.shape().to_vec(),
        mask_shape: msk.shape().to_vec(),
        image_dtype: img.dtype(),
        mask_dtype: msk.dtype(),
        unique_mask_values: unique,
        image,
        mask,
    });
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakemap_core::io::write_geotiff;
    use lakemap_core::{GeoTransform, CRS};
    use ndarray::Array2;

    fn georef<T: lakemap_core::RasterElement>(mut r: Raster<T>) -> Raster<T> {
        r.set_transform(GeoTransform::new(500_000.0, 7_600_000.0, 10.0, -10.0));
        r.set_crs(Some(CRS::from_epsg(32622)));
        r
    }

    /// 8x12 pair; the lake occupies the top-left 4x4 block
    fn write_pair(dir: &Path, base: &str) {
        let image = georef(Raster::from_array(Array2::from_shape_fn((8, 12), |(r, c)| {
            if r < 4 && c < 4 {
                1.5f32
            } else {
                -0.4
            }
        })));
        let lake = georef(Raster::from_array(Array2::from_shape_fn((8, 12), |(r, c)| u8::from(r < 4 && c < 4))));
        write_geotiff(&image, dir.join(format!("{base}_ndwi_0.25.tif")), None).unwrap();
        write_geotiff(&lake, dir.join(format!("{base}_lake_ndwi0.25_dem0.tif")), None).unwrap();
    }

    fn tiling(keep_empty: bool) -> TilingConfig {
        TilingConfig {
            tile_size: 4,
            stride: 4,
            keep_empty,
            mode: lakemap_parallel::ProcessingMode::Sequential,
            ..Default::default()
        }
    }

    #[test]
    fn pairs_need_a_lake_mask() {
        let tmp = tempfile::tempdir().unwrap();
        write_pair(tmp.path(), "2019-07-15_T22WDA");
        std::fs::write(tmp.path().join("2019-07-20_T22WDA_ndwi_0.25.tif"), b"").unwrap();

        let pairs = find_pairs(tmp.path(), "_ndwi_0.25.tif", "_lake_ndwi0.25_dem0.tif").unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].base, "2019-07-15_T22WDA");
    }

    #[test]
    fn empty_windows_skipped_unless_kept() {
        let tmp = tempfile::tempdir().unwrap();
        write_pair(tmp.path(), "scene");
        let out = tmp.path().join("tiles");

        let summary = make_tiles(tmp.path(), &out, &tiling(false), &PipelineConfig::default()).unwrap();
        assert_eq!(summary.pairs, 1);
        // 2x3 windows, one holds the lake
        assert_eq!(summary.stats, TileStats { written: 1, empty_seen: 5 });
        assert!(summary.images_dir.join("scene_y0_x0.npz").is_file());
        assert!(summary.masks_dir.join("scene_y0_x0.npz").is_file());

        let out_all = tmp.path().join("tiles_all");
        let summary = make_tiles(tmp.path(), &out_all, &tiling(true), &PipelineConfig::default()).unwrap();
        assert_eq!(summary.stats.written, 6);
        assert!(summary.images_dir.join("scene_y4_x8.npz").is_file());
    }

    #[test]
    fn tile_contents() {
        let tmp = tempfile::tempdir().unwrap();
        write_pair(tmp.path(), "scene");
        let out = tmp.path().join("tiles");
        make_tiles(tmp.path(), &out, &tiling(false), &PipelineConfig::default()).unwrap();

        let mut npz = NpzReader::new(File::open(out.join("images/scene_y0_x0.npz")).unwrap()).unwrap();
        let img: ndarray::Array3<f32> = npz.by_name("ndwi").unwrap();
        assert_eq!(img.shape(), &[1, 4, 4]);
        // clipped into [-1, 1]
        assert!(img.iter().all(|&v| v == 1.0));

        let mut npz = NpzReader::new(File::open(out.join("masks/scene_y0_x0.npz")).unwrap()).unwrap();
        let mask: Array2<u8> = npz.by_name("mask").unwrap();
        assert_eq!(mask.shape(), &[4, 4]);
        assert!(mask.iter().all(|&v| v == 1));
    }

    #[test]
    fn mismatched_grids_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_pair(tmp.path(), "scene");
        let mut lake = georef(Raster::filled(8, 12, 1u8));
        lake.set_transform(lake.transform().shifted(1, 0));
        write_geotiff(&lake, tmp.path().join("scene_lake_ndwi0.25_dem0.tif"), None).unwrap();

        let pairs = find_pairs(tmp.path(), "_ndwi_0.25.tif", "_lake_ndwi0.25_dem0.tif").unwrap();
        let out = tmp.path().join("t");
        std::fs::create_dir_all(&out).unwrap();
        let stats = tile_pair(&pairs[0], &out, &out, &tiling(true)).unwrap();
        assert_eq!(stats, TileStats::default());
    }

    #[test]
    fn report_on_written_tiles() {
        let tmp = tempfile::tempdir().unwrap();
        write_pair(tmp.path(), "scene");
        let out = tmp.path().join("tiles");
        make_tiles(tmp.path(), &out, &tiling(true), &PipelineConfig::default()).unwrap();
        std::fs::remove_file(out.join("masks/scene_y4_x8.npz")).unwrap();

        let report = inspect_tiles(&out.join("images"), &out.join("masks")).unwrap();
        assert_eq!(report.image_count, 6);
        assert_eq!(report.mask_count, 5);
        assert_eq!(report.missing_masks, vec!["scene_y4_x8".to_string()]);
        assert!(!report.all_paired());

        let sample = report.sample.unwrap();
        assert_eq!(sample.image_shape, vec![1, 4, 4]);
        assert_eq!(sample.mask_shape, vec![4, 4]);
        assert_eq!(sample.image_dtype, "float32");
        assert_eq!(sample.mask_dtype, "uint8");
        assert!(sample.dims_match);
        assert_eq!(sample.unique_mask_values, vec![1.0]);
    }
}
