//! Binary masks: thresholding and combination with elevation

use super::indices::check_dimensions;
use crate::maybe_rayon::*;
use lakemap_core::raster::{Raster, RasterElement};
use lakemap_core::{Error, Result};
use ndarray::Array2;

/// 1 where `value > threshold`, 0 elsewhere (no-data and NaN included).
///
/// The mask's no-data is 0, matching how the mask GeoTIFFs are written.
pub fn threshold_above<T: RasterElement>(raster: &Raster<T>, threshold: f64) -> Raster<u8> {
    let nodata = raster.nodata();
    let mut mask = raster.map(|v| {
        let above = !v.is_nodata(nodata) && v.to_f64().map_or(false, |x| x > threshold);
        u8::from(above)
    });
    mask.set_nodata(Some(0));
    mask
}

/// Lake mask: water (`mask == 1`) above `elev_min` metres.
///
/// Both rasters must share a grid. DEM no-data and NaN never qualify.
pub fn lake_mask<T: RasterElement>(water: &Raster<u8>, dem: &Raster<T>, elev_min: f64) -> Result<Raster<u8>> {
    check_dimensions(water, dem)?;

    let (rows, cols) = water.shape();
    let dem_nodata = dem.nodata();

    let data: Vec<u8> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            (0..cols)
                .map(|col| {
                    let w = unsafe { water.get_unchecked(row, col) };
                    let z = unsafe { dem.get_unchecked(row, col) };
                    let high = !z.is_nodata(dem_nodata) && z.to_f64().map_or(false, |z| z > elev_min);
                    u8::from(w == 1 && high)
                })
                .collect::<Vec<u8>>()
        })
        .collect();

    let array = Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))?;
    let mut out = water.with_data(array)?;
    out.set_nodata(Some(0));
    Ok(out)
}

/// Clamp finite values into `[lo, hi]`; NaN stays NaN
pub fn clip_values(raster: &Raster<f32>, lo: f32, hi: f32) -> Raster<f32> {
    let mut out = raster.map(|v| if v.is_nan() { v } else { v.clamp(lo, hi) });
    out.set_nodata(raster.nodata());
    out
}

/// Number of cells equal to 1
pub fn count_ones(mask: &Raster<u8>) -> usize {
    mask.data().iter().filter(|&&v| v == 1).count()
}
