//! Target grid description used for alignment and reprojection

use crate::crs::CRS;
use crate::geometry::Bounds;
use crate::raster::GeoTransform;
use serde::{Deserialize, Serialize};

/// A raster grid without cell values: CRS, transform and shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub crs: Option<CRS>,
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl GridSpec {
    pub fn new(crs: Option<CRS>, transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self {
            crs,
            transform,
            rows,
            cols,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.cols, self.rows)
    }

    /// Same shape, same transform (to a small fraction of a pixel) and equivalent CRS.
    ///
    /// A missing CRS on either side only matches another missing CRS.
    pub fn same_grid(&self, other: &GridSpec) -> bool {
        let crs_match = match (&self.crs, &other.crs) {
            (Some(a), Some(b)) => a.is_equivalent(b),
            (None, None) => true,
            _ => false,
        };
        crs_match && self.shape() == other.shape() && self.transform.approx_eq(&other.transform, 1e-6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_grid_detects_shift_and_crs() {
        let a = GridSpec::new(Some(CRS::from_epsg(32622)), GeoTransform::new(0.0, 100.0, 10.0, -10.0), 10, 10);
        let mut b = a.clone();
        assert!(a.same_grid(&b));

        b.transform = a.transform.shifted(1, 0);
        assert!(!a.same_grid(&b));

        let mut c = a.clone();
        c.crs = Some(CRS::from_epsg(3413));
        assert!(!a.same_grid(&c));

        let mut d = a.clone();
        d.rows = 11;
        assert!(!a.same_grid(&d));
    }
}
