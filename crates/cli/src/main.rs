//! lakemap CLI - supraglacial lake mapping from Sentinel-2 and ArcticDEM

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::LakemapConfig;
use lakemap_core::io::{read_geotiff, write_geotiff, GeoTiffOptions, VectorFormat};
use lakemap_core::{Bounds, Raster};
use lakemap_pipeline::{
    find_safe_dirs, from_json_file, inspect_tiles, make_tiles, prepare_dem_downloads, process_batch, process_safe,
    DemResolution, DemSource, SceneOutcome,
};
use lakemap_parallel::{num_threads, set_num_threads};
use lakemap_unet::{predict_large, sanity_check, threshold, train, LakeTileDataset, UNetSmall};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "lakemap")]
#[command(author, version, about = "Supraglacial lake mapping from Sentinel-2 NDWI and ArcticDEM", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with `pipeline`, `tiling`, `strips` and `train` sections.
    /// Flags given on the command line take precedence.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads (defaults to all cores)
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct SceneArgs {
    /// ArcticDEM GeoTIFF or a directory of strip tiles
    #[arg(long)]
    dem: PathBuf,
    /// Output directory
    #[arg(long)]
    out: PathBuf,
    /// NDWI threshold (water where NDWI > threshold)
    #[arg(long = "ndwi")]
    ndwi: Option<f64>,
    /// Minimum lake elevation in metres
    #[arg(long = "emin")]
    emin: Option<f64>,
    /// Minimum lake area in m²
    #[arg(long)]
    min_area_m2: Option<f64>,
    /// Vector output: geojson, gpkg or shp
    #[arg(long)]
    ext: Option<VectorFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about a raster file
    Info {
        /// Input raster file
        input: PathBuf,
    },
    /// Map lakes in one Sentinel-2 .SAFE product
    Process {
        /// .SAFE directory
        #[arg(long)]
        safe: PathBuf,
        #[command(flatten)]
        scene: SceneArgs,
    },
    /// Map lakes in every .SAFE product under a directory
    Batch {
        /// Directory searched for .SAFE products
        #[arg(long)]
        safe_root: PathBuf,
        /// Glob relative to the root
        #[arg(long = "glob", default_value = "**/*.SAFE")]
        pattern: String,
        #[command(flatten)]
        scene: SceneArgs,
    },
    /// Choose ArcticDEM strips covering a scene and write download lists
    Strips {
        /// Strip index (GeoJSON)
        #[arg(long)]
        index: PathBuf,
        /// Output directory for URL lists and the fetch script
        #[arg(long)]
        out_dir: PathBuf,
        /// Scene bounds as minx,miny,maxx,maxy
        #[arg(long, value_parser = parse_bounds, allow_hyphen_values = true)]
        sentinel_bounds: Bounds,
        /// CRS of the scene bounds
        #[arg(long)]
        sentinel_crs: Option<String>,
        /// Buffer around the scene in metres
        #[arg(long)]
        buffer_m: Option<f64>,
        /// Strip resolution: 2m or 10m
        #[arg(long)]
        resolution: Option<DemResolution>,
        /// Number of strips to keep
        #[arg(long)]
        max_strips: Option<usize>,
    },
    /// Cut NDWI and lake-mask rasters into .npz training tiles
    Tiles {
        /// Directory holding the scene outputs
        #[arg(long)]
        in_dir: PathBuf,
        /// Output root; images/ and masks/ are created inside
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        tile_size: Option<usize>,
        #[arg(long)]
        stride: Option<usize>,
        /// Keep tiles without any lake pixel
        #[arg(long)]
        keep_empty: bool,
    },
    /// Check that image and mask tiles pair up
    CheckTiles {
        #[arg(long, default_value = "data/tiles/images")]
        images: PathBuf,
        #[arg(long, default_value = "data/tiles/masks")]
        masks: PathBuf,
    },
    /// Train the U-Net on exported tiles
    Train {
        #[arg(long, default_value = "data/tiles/images")]
        images: PathBuf,
        #[arg(long, default_value = "data/tiles/masks")]
        masks: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        lr: Option<f32>,
        /// Where to write the weights
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Run one batch through a fresh model and take one optimizer step
    Sanity {
        #[arg(long, default_value = "data/tiles/images")]
        images: PathBuf,
        #[arg(long, default_value = "data/tiles/masks")]
        masks: PathBuf,
        #[arg(long, default_value = "4")]
        batch_size: usize,
    },
    /// Predict a lake mask for an NDWI GeoTIFF with trained weights
    Predict {
        /// Single-band NDWI raster
        input: PathBuf,
        /// Output lake mask (u8)
        output: PathBuf,
        /// Checkpoint written by `train`
        #[arg(long, default_value = "unet_lakes.npz")]
        model: PathBuf,
        /// Window size, a multiple of 8
        #[arg(long, default_value = "256")]
        tile: usize,
        /// Probability above which a pixel is lake
        #[arg(long, default_value = "0.5")]
        threshold: f32,
        /// Also write the probability raster here
        #[arg(long)]
        probabilities: Option<PathBuf>,
    },
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn progress(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb
}

fn done(name: &str, path: &Path, elapsed: std::time::Duration) {
    println!("{} saved to: {}", name, path.display());
    println!("  Processing time: {:.2?}", elapsed);
}

fn parse_bounds(s: &str) -> std::result::Result<Bounds, String> {
    let v: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid bounds '{s}': {e}"))?;
    match v.as_slice() {
        &[min_x, min_y, max_x, max_y] if min_x < max_x && min_y < max_y => Ok(Bounds::new(min_x, min_y, max_x, max_y)),
        &[_, _, _, _] => Err(format!("bounds '{s}' must satisfy minx < maxx and miny < maxy")),
        _ => Err(format!("expected minx,miny,maxx,maxy, got '{s}'")),
    }
}

fn load_config(path: Option<&Path>) -> Result<LakemapConfig> {
    match path {
        Some(p) => {
            let cfg: LakemapConfig =
                from_json_file(p).with_context(|| format!("Failed to read config {}", p.display()))?;
            info!("Loaded config from {}", p.display());
            Ok(cfg)
        }
        None => Ok(LakemapConfig::default()),
    }
}

impl SceneArgs {
    fn apply(&self, cfg: &mut LakemapConfig) {
        let p = &mut cfg.pipeline;
        if let Some(v) = self.ndwi {
            p.ndwi_threshold = v;
        }
        if let Some(v) = self.emin {
            p.elev_min = v;
        }
        if let Some(v) = self.min_area_m2 {
            p.min_area_m2 = v;
        }
        if let Some(v) = self.ext {
            p.vector_format = v;
        }
    }

    fn open_dem(&self) -> Result<DemSource> {
        let pb = spinner("Scanning DEM...");
        let dem = DemSource::open(&self.dem).with_context(|| format!("Failed to open DEM {}", self.dem.display()))?;
        pb.finish_and_clear();
        info!("DEM: {} file(s)", dem.paths().len());
        Ok(dem)
    }
}

fn open_dataset(images: &Path, masks: &Path) -> Result<LakeTileDataset> {
    let ds = LakeTileDataset::new(images, masks).context("Failed to open tile dataset")?;
    info!("Dataset size: {}", ds.len());
    Ok(ds)
}

// ─── Main ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    if let Some(n) = cli.threads {
        set_num_threads(n);
    }
    debug!("using {} threads", num_threads());
    let mut cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info { input } => {
            let pb = spinner("Reading raster...");
            let raster: Raster<f64> = read_geotiff(&input, None).context("Failed to read raster")?;
            pb.finish_and_clear();
            let (rows, cols) = raster.shape();
            let stats = raster.statistics();

            println!("File: {}", input.display());
            println!("Dimensions: {} x {} ({} cells)", cols, rows, raster.len());
            println!("Cell size: {}", raster.cell_size());
            println!("Bounds: {}", raster.bounds());
            if let Some(crs) = raster.crs() {
                println!("CRS: {}", crs);
            }
            if let Some(nodata) = raster.nodata() {
                println!("NoData: {}", nodata);
            }
            println!("\nStatistics:");
            if let Some(min) = stats.min {
                println!("  Min: {:.4}", min);
            }
            if let Some(max) = stats.max {
                println!("  Max: {:.4}", max);
            }
            if let Some(mean) = stats.mean {
                println!("  Mean: {:.4}", mean);
            }
            println!(
                "  Valid cells: {} ({:.1}%)",
                stats.valid_count,
                100.0 * stats.valid_count as f64 / raster.len().max(1) as f64
            );
        }

        Commands::Process { safe, scene } => {
            scene.apply(&mut cfg);
            cfg.pipeline.validate()?;
            let dem = scene.open_dem()?;
            let start = Instant::now();
            match process_safe(&safe, &dem, &scene.out, &cfg.pipeline)
                .with_context(|| format!("Failed to process {}", safe.display()))?
            {
                SceneOutcome::Processed(p) => {
                    println!("Scene {}", p.tag);
                    println!("  Water pixels: {}", p.water_pixels);
                    println!("  Lake pixels:  {}", p.lake_pixels);
                    println!("  Lakes kept:   {}", p.lake_count);
                    println!("  NDWI mask: {}", p.ndwi_mask.display());
                    println!("  Lake mask: {}", p.lake_mask.display());
                    if let Some(lakes) = &p.lakes {
                        done("Lake polygons", lakes, start.elapsed());
                    } else {
                        println!("  Processing time: {:.2?}", start.elapsed());
                    }
                }
                SceneOutcome::Skipped { tag, reason } => {
                    warn!("{tag} skipped: {reason:?}");
                }
            }
        }

        Commands::Batch {
            safe_root,
            pattern,
            scene,
        } => {
            scene.apply(&mut cfg);
            cfg.pipeline.validate()?;
            let safes = find_safe_dirs(&safe_root, &pattern)?;
            if safes.is_empty() {
                bail!("No .SAFE directories matching '{}' under {}", pattern, safe_root.display());
            }
            info!("Found {} .SAFE products", safes.len());
            let dem = scene.open_dem()?;

            let start = Instant::now();
            let pb = progress(safes.len() as u64);
            let summary = process_batch(&safes, &dem, &scene.out, &cfg.pipeline, |name| {
                pb.set_message(name.to_string());
                pb.inc(1);
            });
            pb.finish_and_clear();

            println!(
                "Processed: {}  Skipped: {}  Failed: {}",
                summary.processed,
                summary.skipped,
                summary.failed.len()
            );
            for (name, err) in &summary.failed {
                println!("  {name}: {err}");
            }
            println!("  Processing time: {:.2?}", start.elapsed());
        }

        Commands::Strips {
            index,
            out_dir,
            sentinel_bounds,
            sentinel_crs,
            buffer_m,
            resolution,
            max_strips,
        } => {
            let s = &mut cfg.strips;
            if let Some(v) = sentinel_crs {
                s.sentinel_crs = v;
            }
            if let Some(v) = buffer_m {
                s.buffer_m = v;
            }
            if let Some(v) = resolution {
                s.resolution = v;
            }
            if let Some(v) = max_strips {
                s.max_strips = v;
            }

            let pb = spinner("Selecting strips...");
            let (selection, lists) = prepare_dem_downloads(&index, &sentinel_bounds, &out_dir, &cfg.strips)
                .context("Failed to select ArcticDEM strips")?;
            pb.finish_and_clear();

            println!("Overlapping strips: {}", selection.overlapping);
            println!("Selected: {}", selection.strips.len());
            for strip in &selection.strips {
                let date = strip.acquired.map(|d| d.date().to_string()).unwrap_or_else(|| "-".into());
                println!("  {}  {}  {:.0}", strip.id, date, strip.intersect_area);
            }
            println!("URL list: {}", lists.chosen.display());
            println!("Fetch script: {}", lists.fetch_script.display());
        }

        Commands::Tiles {
            in_dir,
            out_dir,
            tile_size,
            stride,
            keep_empty,
        } => {
            let t = &mut cfg.tiling;
            if let Some(v) = tile_size {
                t.tile_size = v;
            }
            if let Some(v) = stride {
                t.stride = v;
            }
            t.keep_empty |= keep_empty;

            let start = Instant::now();
            let pb = spinner("Writing tiles...");
            let summary = make_tiles(&in_dir, &out_dir, &cfg.tiling, &cfg.pipeline).context("Failed to write tiles")?;
            pb.finish_and_clear();

            println!("Scene pairs: {}", summary.pairs);
            println!("Tiles written: {}", summary.stats.written);
            println!("Empty windows: {}", summary.stats.empty_seen);
            done("Tiles", &out_dir, start.elapsed());
        }

        Commands::CheckTiles { images, masks } => {
            let report = inspect_tiles(&images, &masks)?;
            println!("Image tiles: {}", report.image_count);
            println!("Mask tiles:  {}", report.mask_count);
            if !report.missing_masks.is_empty() {
                println!("Images without mask (first 10): {:?}", report.missing_masks);
            }
            if !report.missing_images.is_empty() {
                println!("Masks without image (first 10): {:?}", report.missing_images);
            }
            if let Some(s) = &report.sample {
                println!("\nSample: {}", s.image.display());
                println!("  Image shape: {:?}, dtype: {}", s.image_shape, s.image_dtype);
                println!("  Mask shape:  {:?}, dtype: {}", s.mask_shape, s.mask_dtype);
                println!("  Spatial dims match: {}", s.dims_match);
                println!("  Unique mask values (first 10): {:?}", s.unique_mask_values);
            }
            if report.all_paired() {
                println!("All tiles are paired.");
            }
        }

        Commands::Train {
            images,
            masks,
            epochs,
            batch_size,
            lr,
            checkpoint,
        } => {
            let t = &mut cfg.train;
            if let Some(v) = epochs {
                t.epochs = v;
            }
            if let Some(v) = batch_size {
                t.batch_size = v;
            }
            if let Some(v) = lr {
                t.learning_rate = v;
            }
            if checkpoint.is_some() {
                t.checkpoint = checkpoint;
            }

            let ds = open_dataset(&images, &masks)?;
            let start = Instant::now();
            let (_, report) = train(&ds, &cfg.train).context("Training failed")?;
            println!("Train tiles: {}  Val tiles: {}", report.train_size, report.val_size);
            if let Some(last) = report.epochs.last() {
                println!("Final train loss: {:.4}  val loss: {:.4}", last.train_loss, last.val_loss);
            }
            match &report.checkpoint {
                Some(path) => done("Model", path, start.elapsed()),
                None => println!("  Processing time: {:.2?}", start.elapsed()),
            }
        }

        Commands::Sanity {
            images,
            masks,
            batch_size,
        } => {
            let ds = open_dataset(&images, &masks)?;
            let report = sanity_check(&ds, batch_size, cfg.train.seed).context("Sanity check failed")?;
            println!("Batch shape:  {:?}", report.batch_shape);
            println!("Logits shape: {:?}", report.logits_shape);
            println!("Initial loss: {:.4}", report.initial_loss);
            println!("Loss after one step: {:.4}", report.loss_after_step);
        }

        Commands::Predict {
            input,
            output,
            model,
            tile,
            threshold: thr,
            probabilities,
        } => {
            let ndwi: Raster<f32> = read_geotiff(&input, None).context("Failed to read raster")?;
            let ndwi = ndwi.nodata_to_nan();
            info!("Input: {} x {}", ndwi.cols(), ndwi.rows());

            let mut net = UNetSmall::with_width(1, 1, cfg.train.width, &mut ChaCha8Rng::seed_from_u64(cfg.train.seed));
            net.load_checkpoint(&model)
                .with_context(|| format!("Failed to load model {}", model.display()))?;
            info!("Loaded model from {}", model.display());

            let start = Instant::now();
            let pb = spinner("Predicting...");
            let probs = predict_large(&mut net, ndwi.view(), tile)?;
            pb.finish_and_clear();

            let mut mask = ndwi.with_data(threshold(&probs, thr))?;
            mask.set_nodata(None);
            write_geotiff(&mask, &output, Some(GeoTiffOptions::default())).context("Failed to write output")?;
            if let Some(path) = probabilities {
                let mut p = ndwi.with_data(probs)?;
                p.set_nodata(None);
                write_geotiff(&p, &path, Some(GeoTiffOptions::default())).context("Failed to write output")?;
            }
            let lake = mask.data().iter().filter(|&&v| v == 1).count();
            println!("Lake pixels: {}", lake);
            done("Predicted mask", &output, start.elapsed());
        }
    }

    Ok(())
}
