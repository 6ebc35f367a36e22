//! Georeferenced raster grid

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::geometry::Bounds;
use crate::raster::{GeoTransform, GridSpec, RasterElement};
use ndarray::{Array2, ArrayView2, ArrayViewMut2};

/// A georeferenced 2D raster.
///
/// Cells are stored row-major as `(row, col)` in an `Array2<T>` together
/// with the affine transform, an optional CRS and an optional no-data value.
///
/// ```ignore
/// use lakemap_core::{GeoTransform, Raster, CRS};
///
/// let mut ndwi: Raster<f32> = Raster::new(1098, 1098);
/// ndwi.set_transform(GeoTransform::new(499_980.0, 7_800_000.0, 10.0, -10.0));
/// ndwi.set_crs(Some(CRS::from_epsg(32622)));
/// ```
#[derive(Debug, Clone)]
pub struct Raster<T: RasterElement> {
    data: Array2<T>,
    transform: GeoTransform,
    crs: Option<CRS>,
    nodata: Option<T>,
}

impl<T: RasterElement> Raster<T> {
    /// Zero-filled raster with the default transform
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::from_array(Array2::zeros((rows, cols)))
    }

    /// Raster filled with `value`
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self::from_array(Array2::from_elem((rows, cols), value))
    }

    /// Raster from row-major values
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidDimensions {
                width: cols,
                height: rows,
            });
        }
        let array = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(Self::from_array(array))
    }

    pub fn from_array(data: Array2<T>) -> Self {
        Self {
            data,
            transform: GeoTransform::default(),
            crs: None,
            nodata: None,
        }
    }

    /// Replace the cell values, keeping the georeferencing
    pub fn with_data<U: RasterElement>(&self, data: Array2<U>) -> Result<Raster<U>> {
        if data.dim() != self.shape() {
            let (er, ec) = self.shape();
            let (ar, ac) = data.dim();
            return Err(Error::SizeMismatch { er, ec, ar, ac });
        }
        Ok(Raster {
            data,
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: None,
        })
    }

    /// Cell-wise map into a new element type
    pub fn map<U: RasterElement, F: Fn(T) -> U>(&self, f: F) -> Raster<U> {
        Raster {
            data: self.data.mapv(f),
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: None,
        }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        self.data
            .get((row, col))
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
    }

    /// Value at (row, col) without bounds checking
    ///
    /// # Safety
    /// Caller must ensure row < self.rows() and col < self.cols()
    pub unsafe fn get_unchecked(&self, row: usize, col: usize) -> T {
        unsafe { *self.data.uget((row, col)) }
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        let (rows, cols) = self.shape();
        match self.data.get_mut((row, col)) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(Error::IndexOutOfBounds { row, col, rows, cols }),
        }
    }

    pub fn view(&self) -> ArrayView2<'_, T> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, T> {
        self.data.view_mut()
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn into_array(self) -> Array2<T> {
        self.data
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: GeoTransform) {
        self.transform = transform;
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    pub fn set_crs(&mut self, crs: Option<CRS>) {
        self.crs = crs;
    }

    pub fn nodata(&self) -> Option<T> {
        self.nodata
    }

    pub fn set_nodata(&mut self, nodata: Option<T>) {
        self.nodata = nodata;
    }

    pub fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    /// Map-space envelope
    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.cols(), self.rows())
    }

    /// Grid this raster is laid out on
    pub fn grid(&self) -> GridSpec {
        GridSpec {
            crs: self.crs.clone(),
            transform: self.transform,
            rows: self.rows(),
            cols: self.cols(),
        }
    }

    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        self.transform.pixel_to_geo(col, row)
    }

    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        self.transform.geo_to_pixel(x, y)
    }

    pub fn is_nodata(&self, value: T) -> bool {
        value.is_nodata(self.nodata)
    }

    /// Min, max, mean and valid count over non-nodata cells
    pub fn statistics(&self) -> RasterStatistics<T> {
        let mut min: Option<T> = None;
        let mut max: Option<T> = None;
        let mut sum = 0.0f64;
        let mut count = 0usize;

        for &value in self.data.iter() {
            if self.is_nodata(value) {
                continue;
            }
            if min.map_or(true, |m| value < m) {
                min = Some(value);
            }
            if max.map_or(true, |m| value > m) {
                max = Some(value);
            }
            if let Some(v) = value.to_f64() {
                sum += v;
                count += 1;
            }
        }

        RasterStatistics {
            min,
            max,
            mean: (count > 0).then(|| sum / count as f64),
            valid_count: count,
            nodata_count: self.len() - count,
        }
    }
}

impl Raster<f32> {
    /// Replace the no-data sentinel by NaN so downstream comparisons fail naturally
    pub fn nodata_to_nan(mut self) -> Self {
        if let Some(nd) = self.nodata {
            if !nd.is_nan() {
                self.data.mapv_inplace(|v| if v.is_nodata(Some(nd)) { f32::NAN } else { v });
            }
        }
        self.nodata = Some(f32::NAN);
        self
    }
}

/// Summary statistics of the valid cells of a raster
#[derive(Debug, Clone)]
pub struct RasterStatistics<T> {
    pub min: Option<T>,
    pub max: Option<T>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    pub nodata_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn create_and_access() {
        let mut r: Raster<f32> = Raster::new(4, 6);
        assert_eq!(r.shape(), (4, 6));
        r.set(2, 5, 3.5).unwrap();
        assert_eq!(r.get(2, 5).unwrap(), 3.5);
        assert!(r.get(4, 0).is_err());
        assert!(r.set(0, 6, 1.0).is_err());
    }

    #[test]
    fn statistics_skip_nodata() {
        let mut r = Raster::from_vec(vec![1.0f32, 2.0, -9999.0, f32::NAN, 5.0, 4.0], 2, 3).unwrap();
        r.set_nodata(Some(-9999.0));
        let stats = r.statistics();
        assert_eq!(stats.min, Some(1.0));
        assert_eq!(stats.max, Some(5.0));
        assert_eq!(stats.valid_count, 4);
        assert_eq!(stats.nodata_count, 2);
        assert_relative_eq!(stats.mean.unwrap(), 3.0);
    }

    #[test]
    fn nodata_to_nan_replaces_sentinel() {
        let mut r = Raster::from_vec(vec![-9999.0f32, 12.0], 1, 2).unwrap();
        r.set_nodata(Some(-9999.0));
        let r = r.nodata_to_nan();
        assert!(r.get(0, 0).unwrap().is_nan());
        assert_eq!(r.get(0, 1).unwrap(), 12.0);
    }

    #[test]
    fn with_data_checks_shape() {
        let r: Raster<f32> = Raster::new(3, 3);
        assert!(r.with_data(Array2::<u8>::zeros((3, 3))).is_ok());
        assert!(matches!(
            r.with_data(Array2::<u8>::zeros((2, 3))),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
