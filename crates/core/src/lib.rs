//! # lakemap-core
//!
//! Core types and I/O shared by the lake mapping pipeline.
//!
//! This crate provides:
//! - `Raster<T>`: georeferenced grid backed by `ndarray`
//! - `GeoTransform` and `GridSpec`: pixel/map coordinate conversion and target grids
//! - `CRS` and `Projection`: EPSG handling with pure-Rust UTM and polar stereographic math
//! - `Bounds`: envelope overlap tests and densified reprojection
//! - I/O for GeoTIFF rasters and GeoJSON feature collections

pub mod crs;
pub mod error;
pub mod geometry;
pub mod io;
pub mod raster;
pub mod vector;

pub use crs::{Projection, CRS};
pub use error::{Error, Result};
pub use geometry::Bounds;
pub use raster::{GeoTransform, GridSpec, Raster, RasterElement};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::crs::{Projection, CRS};
    pub use crate::error::{Error, Result};
    pub use crate::geometry::Bounds;
    pub use crate::raster::{GeoTransform, GridSpec, Raster, RasterElement};
}
