//! Affine geotransformation for rasters

use crate::geometry::Bounds;
use serde::{Deserialize, Serialize};

/// Affine coefficients mapping pixel (col, row) to map (x, y):
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
///
/// North-up rasters have zero rotation and a negative `pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    /// From GDAL order `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`
    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            origin_y: c[3],
            col_rotation: c[4],
            pixel_height: c[5],
        }
    }

    /// To GDAL order
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    /// Map coordinates of a fractional pixel position
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Map coordinates of a pixel center
    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Map coordinates of a pixel's upper-left corner
    pub fn pixel_to_geo_corner(&self, col: usize, row: usize) -> (f64, f64) {
        self.apply(col as f64, row as f64)
    }

    /// Fractional pixel position of a map coordinate; NaN for degenerate transforms
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        if det.abs() < 1e-12 {
            return (f64::NAN, f64::NAN);
        }

        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (self.pixel_height * dx - self.row_rotation * dy) / det;
        let row = (-self.col_rotation * dx + self.pixel_width * dy) / det;
        (col, row)
    }

    /// Transform of a window whose upper-left pixel is (`col_off`, `row_off`)
    pub fn shifted(&self, col_off: usize, row_off: usize) -> Self {
        let (x, y) = self.pixel_to_geo_corner(col_off, row_off);
        Self {
            origin_x: x,
            origin_y: y,
            ..*self
        }
    }

    /// Cell size (square pixels, no rotation)
    pub fn cell_size(&self) -> f64 {
        self.pixel_width.abs()
    }

    pub fn is_north_up(&self) -> bool {
        self.row_rotation.abs() < 1e-12 && self.col_rotation.abs() < 1e-12 && self.pixel_height < 0.0
    }

    /// Envelope of a `width` x `height` raster
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let corners = [
            self.pixel_to_geo_corner(0, 0),
            self.pixel_to_geo_corner(width, 0),
            self.pixel_to_geo_corner(0, height),
            self.pixel_to_geo_corner(width, height),
        ];
        Bounds::from_points(corners.iter().copied())
    }

    /// Near-equality used when deciding whether two grids line up
    pub fn approx_eq(&self, other: &GeoTransform, tol: f64) -> bool {
        let a = self.to_gdal();
        let b = other.to_gdal();
        let scale = self.pixel_width.abs().max(1e-12);
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tol * scale)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, -1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn center_roundtrip() {
        let gt = GeoTransform::new(500_000.0, 7_700_000.0, 10.0, -10.0);
        let (x, y) = gt.pixel_to_geo(5, 10);
        assert_relative_eq!(x, 500_055.0);
        assert_relative_eq!(y, 7_699_895.0);

        let (col, row) = gt.geo_to_pixel(x, y);
        assert_relative_eq!(col, 5.5, epsilon = 1e-9);
        assert_relative_eq!(row, 10.5, epsilon = 1e-9);
    }

    #[test]
    fn bounds_of_north_up_grid() {
        let gt = GeoTransform::new(0.0, 100.0, 2.0, -2.0);
        let b = gt.bounds(50, 25);
        assert_relative_eq!(b.min_x, 0.0);
        assert_relative_eq!(b.max_x, 100.0);
        assert_relative_eq!(b.min_y, 50.0);
        assert_relative_eq!(b.max_y, 100.0);
    }

    #[test]
    fn shifted_window_origin() {
        let gt = GeoTransform::new(100.0, 200.0, 10.0, -10.0);
        let w = gt.shifted(3, 2);
        assert_relative_eq!(w.origin_x, 130.0);
        assert_relative_eq!(w.origin_y, 180.0);
        assert_relative_eq!(w.pixel_width, 10.0);
        assert!(gt.approx_eq(&gt.shifted(0, 0), 1e-9));
        assert!(!gt.approx_eq(&w, 1e-9));
    }
}
