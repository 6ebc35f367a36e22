//! # lakemap-pipeline
//!
//! Scene-level workflow for supraglacial lake mapping:
//!
//! - **safe**: locating bands inside Sentinel-2 `.SAFE` products and computing NDWI
//! - **dem**: ArcticDEM sources (file or strip tiles) aligned onto Sentinel grids
//! - **scene**: NDWI mask, DEM filter, polygonization and area filter per scene
//! - **strips**: choosing ArcticDEM strips for an area and writing download lists
//! - **tiles**: sliding-window `.npz` export of training tiles
//!
//! ```ignore
//! use lakemap_pipeline::{process_safe, DemSource, PipelineConfig};
//!
//! let dem = DemSource::open("data/ArcticDEM/tiles".as_ref())?;
//! process_safe("S2B_MSIL2A_20190715T151809_N0213_R068_T22WDA_20190715T172254.SAFE".as_ref(),
//!              &dem, "out".as_ref(), &PipelineConfig::default())?;
//! ```

pub mod config;
pub mod dem;
pub mod error;
pub mod safe;
pub mod scene;
pub mod strips;
pub mod tiles;

pub use config::{from_json_file, DemResolution, PipelineConfig, StripSelectionConfig, TilingConfig};
pub use dem::{align_dem_to_sentinel, clip_to_ref_bounds, load_dem, reproject_dem_to_grid, AlignedDem, DemCache, DemSource};
pub use error::{PipelineError, Result};
pub use safe::{dem_crs, find_band_path, load_ndwi, load_profile, safe_crs, SafeId};
pub use scene::{find_safe_dirs, process_batch, process_safe, BatchSummary, SceneOutcome, SceneProducts, SkipReason};
pub use strips::{prepare_dem_downloads, rewrite_resolution, select_strips, write_download_lists, StripSelection};
pub use tiles::{find_pairs, inspect_tiles, make_tiles, tile_pair, TilePair, TileReport, TileStats, TilingSummary};
