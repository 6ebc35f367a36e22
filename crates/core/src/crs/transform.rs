//! Point and envelope transformation between two CRS

use super::{Projection, CRS};
use crate::error::Result;
use crate::geometry::Bounds;

/// Points added along each envelope edge, as rasterio's `transform_bounds` does
pub const DEFAULT_DENSIFY_PTS: usize = 21;

/// Converts coordinates from one CRS into another through WGS84 lon/lat.
///
/// Equivalent CRS (including two CRS we cannot project but that compare
/// equal) give an identity transformer.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    steps: Option<(Projection, Projection)>,
}

impl Transformer {
    pub fn new(src: &CRS, dst: &CRS) -> Result<Self> {
        if src.is_equivalent(dst) {
            return Ok(Self::identity());
        }
        Ok(Self {
            steps: Some((src.projection()?, dst.projection()?)),
        })
    }

    /// Transformer for optional CRS; a missing side is treated as "same CRS"
    pub fn between(src: Option<&CRS>, dst: Option<&CRS>) -> Result<Self> {
        match (src, dst) {
            (Some(s), Some(d)) => Self::new(s, d),
            _ => Ok(Self::identity()),
        }
    }

    pub fn identity() -> Self {
        Self { steps: None }
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_none()
    }

    pub fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        match &self.steps {
            None => (x, y),
            Some((src, dst)) => {
                let (lon, lat) = src.inverse(x, y);
                dst.forward(lon, lat)
            }
        }
    }
}

/// Transform a single point
pub fn transform_point(src: &CRS, dst: &CRS, x: f64, y: f64) -> Result<(f64, f64)> {
    Ok(Transformer::new(src, dst)?.transform(x, y))
}

/// Transform an envelope, densifying each edge with `densify_pts` extra points
/// and returning the envelope of the transformed outline.
pub fn transform_bounds(src: &CRS, dst: &CRS, bounds: &Bounds, densify_pts: usize) -> Result<Bounds> {
    let tr = Transformer::new(src, dst)?;
    if tr.is_identity() {
        return Ok(*bounds);
    }

    let n = densify_pts + 1;
    let mut pts = Vec::with_capacity(4 * n);
    for i in 0..n {
        let f = i as f64 / n as f64;
        let x = bounds.min_x + f * bounds.width();
        let y = bounds.min_y + f * bounds.height();
        let x_rev = bounds.max_x - f * bounds.width();
        let y_rev = bounds.max_y - f * bounds.height();
        pts.push(tr.transform(x, bounds.min_y));
        pts.push(tr.transform(bounds.max_x, y));
        pts.push(tr.transform(x_rev, bounds.max_y));
        pts.push(tr.transform(bounds.min_x, y_rev));
    }
    Ok(Bounds::from_points(pts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_for_equivalent_crs() {
        let t = Transformer::new(&CRS::from_epsg(32622), &CRS::from_epsg(32622)).unwrap();
        assert!(t.is_identity());
        assert_eq!(t.transform(1.0, 2.0), (1.0, 2.0));
        assert!(Transformer::between(None, Some(&CRS::from_epsg(3413))).unwrap().is_identity());
    }

    #[test]
    fn unsupported_crs_errors() {
        assert!(Transformer::new(&CRS::from_epsg(2154), &CRS::from_epsg(4326)).is_err());
    }

    #[test]
    fn utm_to_polar_and_back() {
        let utm = CRS::from_epsg(32622);
        let ps = CRS::from_epsg(3413);
        let fwd = Transformer::new(&utm, &ps).unwrap();
        let back = Transformer::new(&ps, &utm).unwrap();
        let (x, y) = fwd.transform(500_000.0, 7_650_000.0);
        let (e, n) = back.transform(x, y);
        assert_abs_diff_eq!(e, 500_000.0, epsilon = 1e-3);
        assert_abs_diff_eq!(n, 7_650_000.0, epsilon = 1e-3);
    }

    #[test]
    fn densified_bounds_contain_corners() {
        let src = CRS::from_epsg(32622);
        let dst = CRS::from_epsg(3413);
        let b = Bounds::new(399_960.0, 7_590_240.0, 509_760.0, 7_700_040.0);
        let out = transform_bounds(&src, &dst, &b, DEFAULT_DENSIFY_PTS).unwrap();
        let tr = Transformer::new(&src, &dst).unwrap();
        for (x, y) in [(b.min_x, b.min_y), (b.max_x, b.max_y), (b.min_x, b.max_y), (b.max_x, b.min_y)] {
            let (px, py) = tr.transform(x, y);
            assert!(out.contains_point(px, py));
        }
        assert!(out.width() > 100_000.0 && out.width() < 140_000.0);
    }
}
