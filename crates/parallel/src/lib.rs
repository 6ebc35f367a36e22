//! # lakemap-parallel
//!
//! Execution helpers shared by the pipeline:
//! - Sliding windows over a raster for training tile export
//! - Sequential or rayon-backed mapping over work items

pub mod strategy;
pub mod tiled;

pub use strategy::{num_threads, set_num_threads, ParallelStrategy, ProcessingMode};
pub use tiled::{SlidingWindows, Tile};
