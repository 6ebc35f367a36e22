//! Polygon areas in a metric CRS

use crate::maybe_rayon::*;
use geo::{Area, MapCoords};
use geo_types::{Coord, Polygon};
use lakemap_core::crs::{utm_epsg_for, Transformer, CRS};
use lakemap_core::geometry::Bounds;
use lakemap_core::{Error, Result};
use tracing::debug;

/// CRS in which areas of features lying in `bounds` are measured.
///
/// A projected CRS is used as is. For geographic coordinates the UTM zone
/// of the bounds centre is chosen.
pub fn metric_crs_for(crs: &CRS, bounds: &Bounds) -> Result<CRS> {
    if crs.is_metric() {
        return Ok(crs.clone());
    }
    if crs.is_geographic() {
        let (lon, lat) = bounds.center();
        return Ok(CRS::from_epsg(utm_epsg_for(lon, lat)));
    }
    Err(Error::UnsupportedCrs(crs.identifier()))
}

/// Reproject `polygons` into `area_crs` and keep those of at least
/// `min_area_m2` square metres.
///
/// Returns the reprojected polygon with its area. A missing `src_crs`
/// means the polygons are already in `area_crs`.
pub fn filter_by_area(
    polygons: Vec<Polygon<f64>>,
    src_crs: Option<&CRS>,
    area_crs: &CRS,
    min_area_m2: f64,
) -> Result<Vec<(Polygon<f64>, f64)>> {
    if !area_crs.is_metric() {
        return Err(Error::InvalidParameter {
            name: "area_crs",
            value: area_crs.identifier(),
            reason: "areas must be measured in a projected CRS".into(),
        });
    }
    let tr = Transformer::between(src_crs, Some(area_crs))?;
    let total = polygons.len();

    let kept: Vec<(Polygon<f64>, f64)> = polygons
        .into_par_iter()
        .filter_map(|p| {
            let p = if tr.is_identity() {
                p
            } else {
                p.map_coords(|c| {
                    let (x, y) = tr.transform(c.x, c.y);
                    Coord { x, y }
                })
            };
            let area = p.unsigned_area();
            (area >= min_area_m2).then_some((p, area))
        })
        .collect();

    debug!(total, kept = kept.len(), min_area_m2, "area filter");
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(x: f64, y: f64, side: f64) -> Polygon<f64> {
        Bounds::new(x, y, x + side, y + side).to_polygon()
    }

    #[test]
    fn projected_crs_is_kept() {
        let utm = CRS::from_epsg(32622);
        let b = Bounds::new(400_000.0, 7_600_000.0, 500_000.0, 7_700_000.0);
        assert_eq!(metric_crs_for(&utm, &b).unwrap().epsg(), Some(32622));
    }

    #[test]
    fn geographic_picks_utm_zone() {
        let b = Bounds::new(-50.0, 68.0, -49.0, 69.0);
        assert_eq!(metric_crs_for(&CRS::wgs84(), &b).unwrap().epsg(), Some(32622));
    }

    #[test]
    fn unknown_crs_errors() {
        assert!(metric_crs_for(&CRS::from_epsg(2154), &Bounds::new(0.0, 0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn filter_in_same_crs() {
        let utm = CRS::from_epsg(32622);
        let polys = vec![square(0.0, 0.0, 20.0), square(100.0, 100.0, 40.0), square(500.0, 0.0, 31.7)];
        let kept = filter_by_area(polys, Some(&utm), &utm, 1000.0).unwrap();
        assert_eq!(kept.len(), 2);
        assert_relative_eq!(kept[0].1, 1600.0);
        assert!(kept[1].1 >= 1000.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let utm = CRS::from_epsg(32622);
        let kept = filter_by_area(vec![square(0.0, 0.0, 10.0)], None, &utm, 100.0).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn polar_polygon_measured_in_utm() {
        let ps = CRS::from_epsg(3413);
        let utm = CRS::from_epsg(32622);
        let (x, y) = Transformer::new(&utm, &ps).unwrap().transform(500_000.0, 7_650_000.0);
        let kept = filter_by_area(vec![square(x, y, 100.0)], Some(&ps), &utm, 0.0).unwrap();
        // polar stereographic scale differs from UTM by well under 5% here
        assert_relative_eq!(kept[0].1, 10_000.0, max_relative = 0.05);
    }

    #[test]
    fn geographic_area_crs_rejected() {
        assert!(filter_by_area(vec![], None, &CRS::wgs84(), 0.0).is_err());
    }
}
