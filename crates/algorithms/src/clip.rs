//! Pixel windows and clipping a raster to a map-space envelope

use lakemap_core::geometry::Bounds;
use lakemap_core::raster::{GeoTransform, Raster, RasterElement};
use lakemap_core::{Error, Result};
use ndarray::s;

/// Fractional pixel window (`col_off`, `row_off`, `width`, `height`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub col_off: f64,
    pub row_off: f64,
    pub width: f64,
    pub height: f64,
}

/// Integer pixel window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    /// Floor the offsets and round the lengths to the nearest pixel.
    ///
    /// Negative offsets are clamped to 0 and the length shortened by the
    /// same amount, so the result never starts before the raster.
    pub fn round(&self) -> PixelWindow {
        let col = self.col_off.floor();
        let row = self.row_off.floor();
        let width = self.width.round();
        let height = self.height.round();
        let (col, width) = clamp_start(col, width);
        let (row, height) = clamp_start(row, height);
        PixelWindow {
            col_off: col,
            row_off: row,
            width,
            height,
        }
    }
}

fn clamp_start(off: f64, len: f64) -> (usize, usize) {
    if off < 0.0 {
        (0, (len + off).max(0.0) as usize)
    } else {
        (off as usize, len.max(0.0) as usize)
    }
}

impl PixelWindow {
    /// Intersect with a `rows` x `cols` raster
    pub fn intersect(&self, rows: usize, cols: usize) -> Option<PixelWindow> {
        let col_end = (self.col_off + self.width).min(cols);
        let row_end = (self.row_off + self.height).min(rows);
        if self.col_off >= col_end || self.row_off >= row_end {
            return None;
        }
        Some(PixelWindow {
            col_off: self.col_off,
            row_off: self.row_off,
            width: col_end - self.col_off,
            height: row_end - self.row_off,
        })
    }
}

/// Window covering `bounds` in the pixel space of `transform`
pub fn window_from_bounds(transform: &GeoTransform, bounds: &Bounds) -> Window {
    let (c0, r0) = transform.geo_to_pixel(bounds.min_x, bounds.max_y);
    let (c1, r1) = transform.geo_to_pixel(bounds.max_x, bounds.min_y);
    let col_off = c0.min(c1);
    let row_off = r0.min(r1);
    Window {
        col_off,
        row_off,
        width: (c1 - c0).abs(),
        height: (r1 - r0).abs(),
    }
}

/// Cut out the part of `raster` covered by `bounds` (given in the raster's CRS).
///
/// The window is rounded, intersected with the raster extent and the
/// output transform moved to the window's upper-left corner.
pub fn clip_to_bounds<T: RasterElement>(raster: &Raster<T>, bounds: &Bounds) -> Result<Raster<T>> {
    let win = window_from_bounds(raster.transform(), bounds).round();
    let (rows, cols) = raster.shape();
    let win = win.intersect(rows, cols).ok_or_else(|| {
        Error::Algorithm(format!("bounds {bounds} do not intersect raster extent {}", raster.bounds()))
    })?;

    let data = raster
        .data()
        .slice(s![
            win.row_off..win.row_off + win.height,
            win.col_off..win.col_off + win.width
        ])
        .to_owned();

    let mut out = Raster::from_array(data);
    out.set_crs(raster.crs().cloned());
    out.set_transform(raster.transform().shifted(win.col_off, win.row_off));
    out.set_nodata(raster.nodata());
    Ok(out)
}

/// [`clip_to_bounds`] with the envelope of a reference raster.
///
/// Both rasters must be in the same CRS.
pub fn clip_to_reference<T: RasterElement, R: RasterElement>(raster: &Raster<T>, reference: &Raster<R>) -> Result<Raster<T>> {
    if let (Some(a), Some(b)) = (raster.crs(), reference.crs()) {
        if !a.is_equivalent(b) {
            return Err(Error::CrsMismatch(a.identifier(), b.identifier()));
        }
    }
    clip_to_bounds(raster, &reference.bounds())
}
