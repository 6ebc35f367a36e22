//! Imagery algorithms: water index and binary lake masks

mod indices;
mod mask;

pub use indices::{ndwi, normalized_difference};
pub use mask::{clip_values, count_ones, lake_mask, threshold_above};
