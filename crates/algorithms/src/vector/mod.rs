//! Vector algorithms
//!
//! - Polygonize: mask regions to polygons with holes
//! - Area filter: reprojection into a metric CRS and minimum-area selection
//! - Clip: polygon against rectangle, for intersection areas

mod area;
mod clip;
mod polygonize;

pub use area::{filter_by_area, metric_crs_for};
pub use clip::{clip_polygon, intersection_area};
pub use polygonize::polygonize;
