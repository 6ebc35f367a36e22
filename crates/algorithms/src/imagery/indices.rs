//! Normalized-difference water index
//!
//! Sentinel-2 L2A reflectances arrive as integer digital numbers (B03 green,
//! B08 near infrared); the index is scale-free so no conversion to surface
//! reflectance is needed.

use crate::maybe_rayon::*;
use lakemap_core::raster::{Raster, RasterElement};
use lakemap_core::{Error, Result};
use ndarray::Array2;

/// `(a - b) / (a + b)` per cell, as f32.
///
/// Cells where either input is no-data, or where `a + b` is zero, become NaN.
/// The output carries `a`'s georeferencing and a NaN no-data value.
pub fn normalized_difference<A, B>(band_a: &Raster<A>, band_b: &Raster<B>) -> Result<Raster<f32>>
where
    A: RasterElement,
    B: RasterElement,
{
    check_dimensions(band_a, band_b)?;

    let (rows, cols) = band_a.shape();
    let nodata_a = band_a.nodata();
    let nodata_b = band_b.nodata();

    let data: Vec<f32> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut out = vec![f32::NAN; cols];
            for (col, cell) in out.iter_mut().enumerate() {
                let a = unsafe { band_a.get_unchecked(row, col) };
                let b = unsafe { band_b.get_unchecked(row, col) };
                if a.is_nodata(nodata_a) || b.is_nodata(nodata_b) {
                    continue;
                }
                let (Some(a), Some(b)) = (a.to_f64(), b.to_f64()) else {
                    continue;
                };
                let sum = a + b;
                if sum.abs() < 1e-10 {
                    continue;
                }
                *cell = ((a - b) / sum) as f32;
            }
            out
        })
        .collect();

    build_output(band_a, rows, cols, data)
}

/// Normalized Difference Water Index (McFeeters, 1996)
///
/// `NDWI = (Green - NIR) / (Green + NIR)`; open water is positive, ice and
/// snow sit near zero, rock and vegetation are negative.
pub fn ndwi<G, N>(green: &Raster<G>, nir: &Raster<N>) -> Result<Raster<f32>>
where
    G: RasterElement,
    N: RasterElement,
{
    normalized_difference(green, nir)
}

pub(crate) fn check_dimensions<A: RasterElement, B: RasterElement>(a: &Raster<A>, b: &Raster<B>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::SizeMismatch {
            er: a.rows(),
            ec: a.cols(),
            ar: b.rows(),
            ac: b.cols(),
        });
    }
    Ok(())
}

fn build_output<A: RasterElement>(template: &Raster<A>, rows: usize, cols: usize, data: Vec<f32>) -> Result<Raster<f32>> {
    let array = Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))?;
    let mut output = template.with_data(array)?;
    output.set_nodata(Some(f32::NAN));
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use lakemap_core::{GeoTransform, CRS};

    fn band(values: Vec<u16>, rows: usize, cols: usize) -> Raster<u16> {
        let mut r = Raster::from_vec(values, rows, cols).unwrap();
        r.set_transform(GeoTransform::new(499_980.0, 7_700_040.0, 10.0, -10.0));
        r.set_crs(Some(CRS::from_epsg(32622)));
        r
    }

    #[test]
    fn water_is_positive() {
        let green = band(vec![1200, 800, 3000, 0], 2, 2);
        let nir = band(vec![300, 2400, 3000, 0], 2, 2);
        let out = ndwi(&green, &nir).unwrap();

        assert_relative_eq!(out.get(0, 0).unwrap(), 0.6, epsilon = 1e-6);
        assert_relative_eq!(out.get(0, 1).unwrap(), -0.5, epsilon = 1e-6);
        assert_relative_eq!(out.get(1, 0).unwrap(), 0.0);
        assert!(out.get(1, 1).unwrap().is_nan(), "zero sum must be NaN");
        assert_eq!(out.crs().and_then(|c| c.epsg()), Some(32622));
        assert_eq!(out.transform(), green.transform());
    }

    #[test]
    fn nodata_propagates() {
        let mut green = band(vec![0, 500], 1, 2);
        green.set_nodata(Some(0));
        let nir = band(vec![100, 100], 1, 2);
        let out = ndwi(&green, &nir).unwrap();
        assert!(out.get(0, 0).unwrap().is_nan());
        assert!(!out.get(0, 1).unwrap().is_nan());
    }

    #[test]
    fn mixed_types_and_range() {
        let green: Raster<f32> = Raster::from_vec((0..64).map(|v| v as f32 * 13.0).collect(), 8, 8).unwrap();
        let nir: Raster<u16> = Raster::from_vec((0..64).map(|v| (64 - v) as u16 * 7).collect(), 8, 8).unwrap();
        let out = ndwi(&green, &nir).unwrap();
        for &v in out.data().iter().filter(|v| !v.is_nan()) {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn size_mismatch() {
        let a: Raster<f32> = Raster::new(3, 3);
        let b: Raster<f32> = Raster::new(3, 4);
        assert!(matches!(ndwi(&a, &b), Err(Error::SizeMismatch { .. })));
    }
}
