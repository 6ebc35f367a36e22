//! Sliding windows over a raster

use lakemap_core::raster::{Raster, RasterElement};
use ndarray::{s, ArrayView2};

/// A square window of a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row offset in the source raster
    pub row_offset: usize,
    /// Column offset in the source raster
    pub col_offset: usize,
    pub size: usize,
}

impl Tile {
    /// View of the window's cells
    pub fn view<'a, T: RasterElement>(&self, raster: &'a Raster<T>) -> ArrayView2<'a, T> {
        raster.data().slice(s![
            self.row_offset..self.row_offset + self.size,
            self.col_offset..self.col_offset + self.size
        ])
    }
}

/// Windows of `tile_size` moved by `stride`, row-major.
///
/// Only windows lying fully inside the raster are produced; a remainder
/// narrower than a tile at the right or bottom edge is not covered.
#[derive(Debug, Clone)]
pub struct SlidingWindows {
    rows: usize,
    cols: usize,
    tile_size: usize,
    stride: usize,
    next_row: usize,
    next_col: usize,
}

impl SlidingWindows {
    /// A zero `stride` is treated as 1
    pub fn new(rows: usize, cols: usize, tile_size: usize, stride: usize) -> Self {
        Self {
            rows,
            cols,
            tile_size,
            stride: stride.max(1),
            next_row: 0,
            next_col: 0,
        }
    }

    /// Number of windows along (rows, cols)
    pub fn grid_shape(&self) -> (usize, usize) {
        let steps = |len: usize| {
            if self.tile_size == 0 || len < self.tile_size {
                0
            } else {
                (len - self.tile_size) / self.stride + 1
            }
        };
        (steps(self.rows), steps(self.cols))
    }
}

impl Iterator for SlidingWindows {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        if self.tile_size == 0 || self.next_row + self.tile_size > self.rows || self.tile_size > self.cols {
            return None;
        }
        let tile = Tile {
            row_offset: self.next_row,
            col_offset: self.next_col,
            size: self.tile_size,
        };
        self.next_col += self.stride;
        if self.next_col + self.tile_size > self.cols {
            self.next_col = 0;
            self.next_row += self.stride;
        }
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (r, c) = self.grid_shape();
        let done = if self.tile_size == 0 || self.next_row + self.tile_size > self.rows {
            r * c
        } else {
            (self.next_row / self.stride) * c + self.next_col / self.stride
        };
        let left = (r * c).saturating_sub(done);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SlidingWindows {}
