//! End-to-end runs over a synthetic `.SAFE` product and DEM

use approx::assert_relative_eq;
use lakemap_core::io::{read_geojson, read_geotiff, write_geotiff};
use lakemap_core::{GeoTransform, Raster, CRS};
use lakemap_pipeline::{
    find_safe_dirs, make_tiles, process_batch, process_safe, DemSource, PipelineConfig, SceneOutcome, SkipReason,
    TilingConfig,
};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SAFE_NAME: &str = "S2B_MSIL2A_20190715T151809_N0213_R068_T22WDA_20190715T172254.SAFE";
const ORIGIN: (f64, f64) = (500_000.0, 7_650_000.0);

fn utm() -> CRS {
    CRS::from_epsg(32622)
}

/// Water: a 20x20 block (kept), a 2x2 block (too small) and a 20x10 block
/// over low ground (rejected by elevation).
fn is_water(r: usize, c: usize) -> bool {
    let big = (10..30).contains(&r) && (10..30).contains(&c);
    let tiny = (45..47).contains(&r) && (10..12).contains(&c);
    let low = (10..30).contains(&r) && (45..55).contains(&c);
    big || tiny || low
}

fn write_band(path: &Path, water: u16, land: u16) {
    let data = Array2::from_shape_fn((60, 60), |(r, c)| if is_water(r, c) { water } else { land });
    let mut band = Raster::from_array(data);
    band.set_transform(GeoTransform::new(ORIGIN.0, ORIGIN.1, 10.0, -10.0));
    band.set_crs(Some(utm()));
    write_geotiff(&band, path, None).unwrap();
}

fn make_safe(root: &Path) -> PathBuf {
    let safe = root.join(SAFE_NAME);
    let img = safe.join("GRANULE/L2A_T22WDA_A012345_20190715T151809/IMG_DATA/R10m");
    std::fs::create_dir_all(&img).unwrap();
    write_band(&img.join("T22WDA_20190715T151809_B03_10m.tif"), 3000, 1000);
    write_band(&img.join("T22WDA_20190715T151809_B08_10m.tif"), 500, 2000);
    safe
}

/// 20 m DEM: 800 m west of x = 500 400, 50 m east of it
fn make_dem(path: &Path, origin: (f64, f64)) {
    let data = Array2::from_shape_fn((40, 40), |(_, c)| if c < 30 { 800.0f32 } else { 50.0 });
    let mut dem = Raster::from_array(data);
    dem.set_transform(GeoTransform::new(origin.0, origin.1, 20.0, -20.0));
    dem.set_crs(Some(utm()));
    dem.set_nodata(Some(-9999.0));
    write_geotiff(&dem, path, None).unwrap();
}

fn config() -> PipelineConfig {
    PipelineConfig {
        elev_min: 100.0,
        ..Default::default()
    }
}

#[test]
fn scene_to_lake_polygons() {
    let tmp = TempDir::new().unwrap();
    let safe = make_safe(tmp.path());
    let dem_path = tmp.path().join("dem.tif");
    make_dem(&dem_path, (ORIGIN.0 - 200.0, ORIGIN.1 + 200.0));
    let out = tmp.path().join("out");

    let dem = DemSource::open(&dem_path).unwrap();
    let outcome = process_safe(&safe, &dem, &out, &config()).unwrap();
    let SceneOutcome::Processed(products) = outcome else {
        panic!("scene was skipped");
    };

    assert_eq!(products.tag, "2019-07-15_T22WDA");
    assert_eq!(products.ndwi_mask, out.join("2019-07-15_T22WDA_ndwi_0.25.tif"));
    assert_eq!(products.lake_mask, out.join("2019-07-15_T22WDA_lake_ndwi0.25_dem100.tif"));
    assert_eq!(products.water_pixels, 400 + 4 + 200);
    assert_eq!(products.lake_pixels, 400 + 4);
    assert_eq!(products.lake_count, 1);

    let mask: Raster<u8> = read_geotiff(&products.lake_mask, None).unwrap();
    assert_eq!(mask.shape(), (60, 60));
    assert_eq!(mask.nodata(), Some(0));
    assert_eq!(mask.get(15, 15).unwrap(), 1);
    assert_eq!(mask.get(15, 50).unwrap(), 0);

    let ndwi: Raster<f32> = read_geotiff(products.ndwi.as_ref().unwrap(), None).unwrap();
    assert_relative_eq!(ndwi.get(15, 15).unwrap(), 2500.0 / 3500.0, epsilon = 1e-6);

    let lakes_path = products.lakes.unwrap();
    assert_eq!(lakes_path, out.join("2019-07-15_T22WDA_lakes.geojson"));
    let fc = read_geojson(&lakes_path).unwrap();
    assert_eq!(fc.len(), 1);
    let f = &fc.features[0];
    assert_relative_eq!(f.get_property("area_m2").unwrap().as_f64().unwrap(), 40_000.0, max_relative = 1e-9);
    assert_eq!(f.get_property("date").unwrap().as_str(), Some("2019-07-15"));
    assert_eq!(f.get_property("safe_name").unwrap().as_str(), Some(SAFE_NAME));
    assert_eq!(f.get_property("elev_min_m").unwrap().as_f64(), Some(100.0));

    assert!(out.join("dem_to_sentinel_T22WDA.tif").is_file());
    assert!(out.join("dem_to_sentinel_T22WDA_clipped.tif").is_file());

    // the second run reuses the aligned DEM and gives the same answer
    let again = process_safe(&safe, &dem, &out, &config()).unwrap();
    assert!(matches!(again, SceneOutcome::Processed(p) if p.lake_pixels == 404));
}

#[test]
fn dem_elsewhere_skips_scene() {
    let tmp = TempDir::new().unwrap();
    let safe = make_safe(tmp.path());
    let dem_path = tmp.path().join("dem.tif");
    make_dem(&dem_path, (ORIGIN.0 + 50_000.0, ORIGIN.1));

    let dem = DemSource::open(&dem_path).unwrap();
    let outcome = process_safe(&safe, &dem, &tmp.path().join("out"), &config()).unwrap();
    assert_eq!(
        outcome,
        SceneOutcome::Skipped {
            tag: "2019-07-15_T22WDA".into(),
            reason: SkipReason::NoDemCoverage
        }
    );
}

#[test]
fn batch_then_tiles() {
    let tmp = TempDir::new().unwrap();
    let safe_root = tmp.path().join("s2");
    make_safe(&safe_root);
    let dem_dir = tmp.path().join("dem");
    std::fs::create_dir_all(&dem_dir).unwrap();
    make_dem(&dem_dir.join("strip_a_dem.tif"), (ORIGIN.0 - 200.0, ORIGIN.1 + 200.0));
    let out = tmp.path().join("out");

    let safes = find_safe_dirs(&safe_root, "**/*.SAFE").unwrap();
    assert_eq!(safes.len(), 1);

    let dem = DemSource::open(&dem_dir).unwrap();
    let mut done = 0;
    let summary = process_batch(&safes, &dem, &out, &config(), |_| done += 1);
    assert_eq!(summary.processed, 1);
    assert!(summary.failed.is_empty());
    assert_eq!(done, 1);

    let tiling = TilingConfig {
        tile_size: 16,
        stride: 16,
        ..Default::default()
    };
    let tiles = make_tiles(&out, &tmp.path().join("tiles"), &tiling, &config()).unwrap();
    assert_eq!(tiles.pairs, 1);
    // the big lake touches four windows, the small one a fifth
    assert_eq!(tiles.stats.written, 5);
    assert_eq!(tiles.stats.empty_seen, 4);
}

fn lake_files(out: &Path) -> usize {
    std::fs::read_dir(out)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("_lakes."))
        .count()
}

#[test]
fn no_surviving_lakes_writes_no_vector_file() {
    let tmp = TempDir::new().unwrap();
    let safe = make_safe(tmp.path());
    let dem_path = tmp.path().join("dem.tif");
    make_dem(&dem_path, (ORIGIN.0 - 200.0, ORIGIN.1 + 200.0));
    let dem = DemSource::open(&dem_path).unwrap();

    // every polygon is smaller than the minimum area
    let out = tmp.path().join("too_small");
    let cfg = PipelineConfig {
        min_area_m2: 1_000_000.0,
        ..config()
    };
    let SceneOutcome::Processed(products) = process_safe(&safe, &dem, &out, &cfg).unwrap() else {
        panic!("scene was skipped");
    };
    assert_eq!(products.lake_pixels, 404);
    assert_eq!(products.lake_count, 0);
    assert!(products.lakes.is_none());
    assert_eq!(lake_files(&out), 0);

    // the DEM never rises above the minimum elevation
    let out = tmp.path().join("too_low");
    let cfg = PipelineConfig {
        elev_min: 5000.0,
        ..config()
    };
    let SceneOutcome::Processed(products) = process_safe(&safe, &dem, &out, &cfg).unwrap() else {
        panic!("scene was skipped");
    };
    assert_eq!(products.lake_pixels, 0);
    assert_eq!(products.lake_count, 0);
    assert!(products.lakes.is_none());
    assert!(products.lake_mask.is_file());
    assert_eq!(lake_files(&out), 0);
}
