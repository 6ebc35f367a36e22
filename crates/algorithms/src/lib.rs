//! # lakemap-algorithms
//!
//! Raster and vector algorithms for supraglacial lake mapping.
//!
//! ## Categories
//!
//! - **imagery**: NDWI, thresholding, lake masks from water + elevation
//! - **warp**: resampling a raster (or a tile mosaic) onto a target grid
//! - **clip**: pixel windows and clipping to an envelope
//! - **vector**: polygonization, metric area filter, rectangle clipping

pub mod clip;
pub mod imagery;
pub(crate) mod maybe_rayon;
pub mod vector;
pub mod warp;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::clip::{clip_to_bounds, clip_to_reference, window_from_bounds, PixelWindow, Window};
    pub use crate::imagery::{clip_values, count_ones, lake_mask, ndwi, normalized_difference, threshold_above};
    pub use crate::vector::{filter_by_area, intersection_area, metric_crs_for, polygonize};
    pub use crate::warp::{reproject_mosaic, reproject_to_grid, ReprojectParams, Resampling};
    pub use lakemap_core::prelude::*;
}
