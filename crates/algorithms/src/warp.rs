//! Resample rasters onto a target grid
//!
//! Each destination pixel centre is transformed into the source CRS and the
//! source is sampled there. This is the inverse-mapping warp GDAL performs,
//! without the chunking or the multi-pass approximation.

use crate::maybe_rayon::*;
use lakemap_core::crs::Transformer;
use lakemap_core::raster::{GridSpec, Raster, RasterElement};
use lakemap_core::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// Value of the source pixel containing the point. Used for masks.
    Nearest,
    /// Distance-weighted mean of the four surrounding pixel centres
    #[default]
    Bilinear,
}

impl std::str::FromStr for Resampling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "near" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            other => Err(Error::InvalidParameter {
                name: "resampling",
                value: other.to_string(),
                reason: "expected nearest or bilinear".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectParams {
    pub resampling: Resampling,
    /// Overrides the source raster's own no-data value
    pub src_nodata: Option<f64>,
    /// Written where nothing valid could be sampled
    pub dst_nodata: f64,
}

impl Default for ReprojectParams {
    fn default() -> Self {
        Self {
            resampling: Resampling::Bilinear,
            src_nodata: None,
            dst_nodata: -9999.0,
        }
    }
}

impl ReprojectParams {
    pub fn nearest(dst_nodata: f64) -> Self {
        Self {
            resampling: Resampling::Nearest,
            src_nodata: None,
            dst_nodata,
        }
    }
}

/// Sampler over one source raster, with the transformer from target to source CRS
struct Source<'a, T: RasterElement> {
    raster: &'a Raster<T>,
    to_src: Transformer,
    nodata: Option<f64>,
}

impl<'a, T: RasterElement> Source<'a, T> {
    fn new(raster: &'a Raster<T>, target: &GridSpec, params: &ReprojectParams) -> Result<Self> {
        let to_src = Transformer::between(target.crs.as_ref(), raster.crs())?;
        let nodata = params.src_nodata.or_else(|| raster.nodata().and_then(|v| v.to_f64()));
        Ok(Self { raster, to_src, nodata })
    }

    fn valid(&self, v: f64) -> bool {
        if !v.is_finite() {
            return false;
        }
        match self.nodata {
            Some(nd) if nd.is_nan() => true,
            Some(nd) => (v - nd).abs() > f64::EPSILON * nd.abs().max(1.0),
            None => true,
        }
    }

    fn value(&self, row: usize, col: usize) -> Option<f64> {
        let v = unsafe { self.raster.get_unchecked(row, col) }.to_f64()?;
        self.valid(v).then_some(v)
    }

    /// Sample at map coordinates expressed in the target CRS
    fn sample(&self, x: f64, y: f64, resampling: Resampling) -> Option<f64> {
        let (sx, sy) = self.to_src.transform(x, y);
        let (px, py) = self.raster.geo_to_pixel(sx, sy);
        let (rows, cols) = self.raster.shape();
        if !(px >= 0.0 && py >= 0.0 && px < cols as f64 && py < rows as f64) {
            return None;
        }

        match resampling {
            Resampling::Nearest => self.value(py.floor() as usize, px.floor() as usize),
            Resampling::Bilinear => self.bilinear(px - 0.5, py - 0.5),
        }
    }

    /// Bilinear weights over the valid neighbours only, renormalized
    fn bilinear(&self, fx: f64, fy: f64) -> Option<f64> {
        let (rows, cols) = self.raster.shape();
        let x0 = fx.floor();
        let y0 = fy.floor();
        let wx = fx - x0;
        let wy = fy - y0;

        let mut acc = 0.0;
        let mut wsum = 0.0;
        for (dy, wy) in [(0.0, 1.0 - wy), (1.0, wy)] {
            for (dx, wx) in [(0.0, 1.0 - wx), (1.0, wx)] {
                let c = x0 + dx;
                let r = y0 + dy;
                let w = wx * wy;
                if w <= 0.0 || c < 0.0 || r < 0.0 || c >= cols as f64 || r >= rows as f64 {
                    continue;
                }
                if let Some(v) = self.value(r as usize, c as usize) {
                    acc += w * v;
                    wsum += w;
                }
            }
        }
        (wsum > 0.0).then(|| acc / wsum)
    }
}

fn dst_fill<T: RasterElement>(params: &ReprojectParams) -> Result<T> {
    T::from_f64(params.dst_nodata).ok_or_else(|| Error::InvalidParameter {
        name: "dst_nodata",
        value: params.dst_nodata.to_string(),
        reason: "does not fit the output element type".into(),
    })
}

/// Resample `src` onto `target`.
///
/// Destination pixels whose centre falls outside the source, or where no
/// valid source value is available, get `params.dst_nodata`. A missing CRS
/// on either side means both grids share one CRS.
pub fn reproject_to_grid<T: RasterElement>(
    src: &Raster<T>,
    target: &GridSpec,
    params: &ReprojectParams,
) -> Result<Raster<T>> {
    reproject_mosaic(std::slice::from_ref(src), target, params)
}

/// Resample several source tiles onto one grid; the first valid sample wins.
pub fn reproject_mosaic<T: RasterElement>(
    sources: &[Raster<T>],
    target: &GridSpec,
    params: &ReprojectParams,
) -> Result<Raster<T>> {
    if target.rows == 0 || target.cols == 0 {
        return Err(Error::InvalidDimensions {
            width: target.cols,
            height: target.rows,
        });
    }
    let fill: T = dst_fill(params)?;
    let samplers = sources
        .iter()
        .map(|r| Source::new(r, target, params))
        .collect::<Result<Vec<_>>>()?;

    debug!(
        sources = sources.len(),
        rows = target.rows,
        cols = target.cols,
        resampling = ?params.resampling,
        "reprojecting onto target grid"
    );

    let (rows, cols) = target.shape();
    let transform = target.transform;
    let data: Vec<T> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut out = vec![fill; cols];
            for (col, cell) in out.iter_mut().enumerate() {
                let (x, y) = transform.pixel_to_geo(col, row);
                let hit = samplers
                    .iter()
                    .find_map(|s| s.sample(x, y, params.resampling))
                    .and_then(T::from_f64);
                if let Some(v) = hit {
                    *cell = v;
                }
            }
            out
        })
        .collect();

    let array = Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))?;
    let mut out = Raster::from_array(array);
    out.set_transform(target.transform);
    out.set_crs(target.crs.clone());
    out.set_nodata(Some(fill));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use lakemap_core::{GeoTransform, CRS};

    fn ramp(rows: usize, cols: usize) -> Raster<f32> {
        let mut r = Raster::from_vec((0..rows * cols).map(|i| (i % cols) as f32).collect(), rows, cols).unwrap();
        r.set_transform(GeoTransform::new(0.0, 100.0, 10.0, -10.0));
        r.set_crs(Some(CRS::from_epsg(32622)));
        r
    }

    #[test]
    fn same_grid_is_identity() {
        let src = ramp(6, 8);
        let out = reproject_to_grid(&src, &src.grid(), &ReprojectParams::default()).unwrap();
        assert_eq!(out.data(), src.data());
        assert!(out.grid().same_grid(&src.grid()));
    }

    #[test]
    fn half_resolution_bilinear_averages() {
        let src = ramp(4, 4);
        let target = GridSpec::new(src.crs().cloned(), GeoTransform::new(0.0, 100.0, 20.0, -20.0), 2, 2);
        let out = reproject_to_grid(&src, &target, &ReprojectParams::default()).unwrap();
        // centre of coarse pixel 0 sits between source columns 0 and 1
        assert_relative_eq!(out.get(0, 0).unwrap(), 0.5, epsilon = 1e-6);
        assert_relative_eq!(out.get(1, 1).unwrap(), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn nearest_keeps_mask_values() {
        let mut mask = Raster::from_vec(vec![0u8, 1, 1, 0], 2, 2).unwrap();
        mask.set_transform(GeoTransform::new(0.0, 20.0, 10.0, -10.0));
        let target = GridSpec::new(None, GeoTransform::new(0.0, 20.0, 5.0, -5.0), 4, 4);
        let out = reproject_to_grid(&mask, &target, &ReprojectParams::nearest(0.0)).unwrap();
        assert!(out.data().iter().all(|&v| v == 0 || v == 1));
        assert_eq!(out.get(0, 3).unwrap(), 1);
        assert_eq!(out.get(3, 0).unwrap(), 1);
        assert_eq!(out.get(0, 0).unwrap(), 0);
    }

    #[test]
    fn outside_source_gets_dst_nodata() {
        let src = ramp(2, 2);
        let target = GridSpec::new(src.crs().cloned(), GeoTransform::new(1000.0, 100.0, 10.0, -10.0), 2, 2);
        let out = reproject_to_grid(&src, &target, &ReprojectParams::default()).unwrap();
        assert!(out.data().iter().all(|&v| v == -9999.0));
        assert_eq!(out.nodata(), Some(-9999.0));
    }

    #[test]
    fn bilinear_skips_nodata_neighbours() {
        let mut src = Raster::from_vec(vec![10.0f32, -9999.0, 10.0, 10.0], 2, 2).unwrap();
        src.set_transform(GeoTransform::new(0.0, 20.0, 10.0, -10.0));
        src.set_nodata(Some(-9999.0));
        let target = GridSpec::new(None, GeoTransform::new(5.0, 15.0, 10.0, -10.0), 1, 1);
        let out = reproject_to_grid(&src, &target, &ReprojectParams::default()).unwrap();
        assert_relative_eq!(out.get(0, 0).unwrap(), 10.0, epsilon = 1e-6);

        let all_nd = Raster::filled(2, 2, f32::NAN);
        let out = reproject_to_grid(&all_nd, &target, &ReprojectParams::default()).unwrap();
        assert_eq!(out.get(0, 0).unwrap(), -9999.0);
    }

    #[test]
    fn mosaic_first_valid_wins() {
        let mut left = Raster::filled(2, 2, 1.0f32);
        left.set_transform(GeoTransform::new(0.0, 20.0, 10.0, -10.0));
        let mut right = Raster::filled(2, 2, 2.0f32);
        right.set_transform(GeoTransform::new(10.0, 20.0, 10.0, -10.0));

        let target = GridSpec::new(None, GeoTransform::new(0.0, 20.0, 10.0, -10.0), 2, 3);
        let out = reproject_mosaic(&[left, right], &target, &ReprojectParams::nearest(-9999.0)).unwrap();
        assert_eq!(out.get(0, 0).unwrap(), 1.0);
        assert_eq!(out.get(0, 1).unwrap(), 1.0);
        assert_eq!(out.get(0, 2).unwrap(), 2.0);
    }

    #[test]
    fn polar_dem_onto_utm_grid() {
        // constant DEM in EPSG:3413 covering a UTM 22N scene
        let utm = CRS::from_epsg(32622);
        let ps = CRS::from_epsg(3413);
        let scene = GridSpec::new(Some(utm.clone()), GeoTransform::new(499_980.0, 7_700_040.0, 60.0, -60.0), 10, 10);
        let b = lakemap_core::crs::transform_bounds(&utm, &ps, &scene.bounds(), 21).unwrap().buffer(500.0);

        let cols = (b.width() / 100.0).ceil() as usize;
        let rows = (b.height() / 100.0).ceil() as usize;
        let mut dem = Raster::filled(rows, cols, 850.0f32);
        dem.set_transform(GeoTransform::new(b.min_x, b.max_y, 100.0, -100.0));
        dem.set_crs(Some(ps));

        let out = reproject_to_grid(&dem, &scene, &ReprojectParams::default()).unwrap();
        assert!(out.data().iter().all(|&v| (v - 850.0).abs() < 1e-3));
        assert_eq!(out.crs().and_then(|c| c.epsg()), Some(32622));
    }

    #[test]
    fn dst_nodata_must_fit() {
        let mask: Raster<u8> = Raster::new(2, 2);
        let err = reproject_to_grid(&mask, &mask.grid(), &ReprojectParams::default());
        assert!(matches!(err, Err(Error::InvalidParameter { .. })));
    }
}
