//! Pure-Rust WGS84 projections (Snyder 1987, USGS Prof. Paper 1395).
//!
//! Covers the CRS a Greenland lake workflow meets: geographic WGS84,
//! UTM north/south (Sentinel-2 tiles), polar stereographic (ArcticDEM
//! EPSG:3413, Antarctic EPSG:3031) and Web Mercator.

use crate::error::{Error, Result};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

// WGS84 ellipsoid
const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const E2: f64 = 2.0 * F - F * F;
const E_PRIME2: f64 = E2 / (1.0 - E2);

const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Forward/inverse math for a supported EPSG code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// EPSG:4326, coordinates are (lon, lat) degrees
    Geographic,
    /// EPSG:326zz / 327zz
    Utm { zone: u8, north: bool },
    /// Polar stereographic with true scale at `lat_ts` (variant B)
    PolarStereographic { north: bool, lat_ts: f64, lon0: f64 },
    /// EPSG:3857
    WebMercator,
}

impl Projection {
    pub fn from_epsg(code: u32) -> Result<Self> {
        let p = match code {
            4326 => Projection::Geographic,
            32601..=32660 => Projection::Utm {
                zone: (code - 32600) as u8,
                north: true,
            },
            32701..=32760 => Projection::Utm {
                zone: (code - 32700) as u8,
                north: false,
            },
            3413 => Projection::PolarStereographic {
                north: true,
                lat_ts: 70.0,
                lon0: -45.0,
            },
            3995 => Projection::PolarStereographic {
                north: true,
                lat_ts: 71.0,
                lon0: 0.0,
            },
            3031 => Projection::PolarStereographic {
                north: false,
                lat_ts: -71.0,
                lon0: 0.0,
            },
            3976 => Projection::PolarStereographic {
                north: false,
                lat_ts: -70.0,
                lon0: 0.0,
            },
            3857 => Projection::WebMercator,
            other => return Err(Error::UnsupportedCrs(format!("EPSG:{}", other))),
        };
        Ok(p)
    }

    /// (lon, lat) degrees to projected (x, y); identity for geographic
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (lon, lat),
            Projection::Utm { zone, north } => utm_forward(lon, lat, zone, north),
            Projection::PolarStereographic { north, lat_ts, lon0 } => {
                if north {
                    polar_forward(lon, lat, lat_ts, lon0)
                } else {
                    let (x, y) = polar_forward(-lon, -lat, -lat_ts, -lon0);
                    (-x, -y)
                }
            }
            Projection::WebMercator => {
                let lat = lat.clamp(-85.051_128_78, 85.051_128_78);
                (
                    A * lon.to_radians(),
                    A * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln(),
                )
            }
        }
    }

    /// Projected (x, y) to (lon, lat) degrees
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (x, y),
            Projection::Utm { zone, north } => utm_inverse(x, y, zone, north),
            Projection::PolarStereographic { north, lat_ts, lon0 } => {
                if north {
                    polar_inverse(x, y, lat_ts, lon0)
                } else {
                    let (lon, lat) = polar_inverse(-x, -y, -lat_ts, -lon0);
                    (-lon, -lat)
                }
            }
            Projection::WebMercator => (
                (x / A).to_degrees(),
                (FRAC_PI_2 - 2.0 * (-y / A).exp().atan()).to_degrees(),
            ),
        }
    }
}

/// EPSG code of the UTM zone containing (lon, lat)
pub fn utm_epsg_for(lon: f64, lat: f64) -> u32 {
    let lon = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
    let zone = (((lon + 180.0) / 6.0).floor() as u32 + 1).min(60);
    if lat >= 0.0 {
        32600 + zone
    } else {
        32700 + zone
    }
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

/// Meridional arc from the equator to `lat` radians (Snyder 3-21)
fn meridional_arc(lat: f64) -> f64 {
    let e4 = E2 * E2;
    let e6 = e4 * E2;
    A * ((1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
        - (3.0 * E2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}

// Snyder 8-9, 8-10
fn utm_forward(lon: f64, lat: f64, zone: u8, north: bool) -> (f64, f64) {
    let phi = lat.to_radians();
    let dlam = (lon - central_meridian(zone)).to_radians();

    let (sin_phi, cos_phi) = phi.sin_cos();
    let tan_phi = phi.tan();
    let n = A / (1.0 - E2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = E_PRIME2 * cos_phi * cos_phi;
    let a1 = cos_phi * dlam;
    let a2 = a1 * a1;
    let a4 = a2 * a2;

    let x = UTM_K0
        * n
        * (a1
            + (1.0 - t + c) * a2 * a1 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * E_PRIME2) * a4 * a1 / 120.0)
        + UTM_FALSE_EASTING;

    let y = UTM_K0
        * (meridional_arc(phi)
            + n * tan_phi
                * (a2 / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * E_PRIME2) * a4 * a2 / 720.0));

    (x, if north { y } else { y + UTM_FALSE_NORTHING_SOUTH })
}

// Snyder 8-12 to 8-25
fn utm_inverse(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let x = x - UTM_FALSE_EASTING;
    let y = if north { y } else { y - UTM_FALSE_NORTHING_SOUTH };

    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let m = y / UTM_K0;
    let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let sq = (1.0 - E2).sqrt();
    let e1 = (1.0 - sq) / (1.0 + sq);
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin1, cos1) = phi1.sin_cos();
    let tan1 = phi1.tan();
    let c1 = E_PRIME2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let w = 1.0 - E2 * sin1 * sin1;
    let n1 = A / w.sqrt();
    let r1 = A * (1.0 - E2) / w.powf(1.5);
    let d = x / (n1 * UTM_K0);
    let d2 = d * d;
    let d4 = d2 * d2;

    let phi = phi1
        - (n1 * tan1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * E_PRIME2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * E_PRIME2 - 3.0 * c1 * c1)
                    * d4
                    * d2
                    / 720.0);

    let dlam = (d - (1.0 + 2.0 * t1 + c1) * d2 * d / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * E_PRIME2 + 24.0 * t1 * t1) * d4 * d
            / 120.0)
        / cos1;

    (central_meridian(zone) + dlam.to_degrees(), phi.to_degrees())
}

/// Snyder 15-9 isometric helper
fn polar_t(phi: f64) -> f64 {
    let e = E2.sqrt();
    let es = e * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(e / 2.0)
}

fn polar_scale(lat_ts: f64) -> (f64, f64) {
    let phi_c = lat_ts.to_radians();
    let s = phi_c.sin();
    let m_c = phi_c.cos() / (1.0 - E2 * s * s).sqrt();
    (m_c, polar_t(phi_c))
}

// North-polar aspect, Snyder 21-33, 21-34
fn polar_forward(lon: f64, lat: f64, lat_ts: f64, lon0: f64) -> (f64, f64) {
    let (m_c, t_c) = polar_scale(lat_ts);
    let rho = A * m_c * polar_t(lat.to_radians()) / t_c;
    let dlam = (lon - lon0).to_radians();
    (rho * dlam.sin(), -rho * dlam.cos())
}

// Snyder 21-38, 3-5
fn polar_inverse(x: f64, y: f64, lat_ts: f64, lon0: f64) -> (f64, f64) {
    let (m_c, t_c) = polar_scale(lat_ts);
    let rho = x.hypot(y);
    if rho == 0.0 {
        return (lon0, 90.0);
    }
    let t = rho * t_c / (A * m_c);
    let chi = FRAC_PI_2 - 2.0 * t.atan();

    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let e8 = e6 * E2;
    let phi = chi
        + (E2 / 2.0 + 5.0 * e4 / 24.0 + e6 / 12.0 + 13.0 * e8 / 360.0) * (2.0 * chi).sin()
        + (7.0 * e4 / 48.0 + 29.0 * e6 / 240.0 + 811.0 * e8 / 11520.0) * (4.0 * chi).sin()
        + (7.0 * e6 / 120.0 + 81.0 * e8 / 1120.0) * (6.0 * chi).sin()
        + (4279.0 * e8 / 161_280.0) * (8.0 * chi).sin();

    let lon = lon0 + x.atan2(-y).to_degrees();
    (normalize_lon(lon), phi.to_degrees())
}

fn normalize_lon(lon: f64) -> f64 {
    let l = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if l == -180.0 && lon > 0.0 {
        180.0
    } else {
        l
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn epsg_lookup() {
        assert_eq!(
            Projection::from_epsg(32622).unwrap(),
            Projection::Utm { zone: 22, north: true }
        );
        assert_eq!(
            Projection::from_epsg(32721).unwrap(),
            Projection::Utm { zone: 21, north: false }
        );
        assert!(matches!(
            Projection::from_epsg(3413).unwrap(),
            Projection::PolarStereographic { north: true, .. }
        ));
        assert!(Projection::from_epsg(32661).is_err());
        assert!(Projection::from_epsg(2154).is_err());
    }

    // pyproj: Transformer.from_crs(4326, 32630, always_xy=True).transform(-3.7037, 40.4168)
    #[test]
    fn utm_forward_reference_point() {
        let p = Projection::from_epsg(32630).unwrap();
        let (e, n) = p.forward(-3.7037, 40.4168);
        assert_abs_diff_eq!(e, 440_298.94, epsilon = 1.0);
        assert_abs_diff_eq!(n, 4_474_257.31, epsilon = 1.0);
    }

    #[test]
    fn utm_south_reference_point() {
        let p = Projection::from_epsg(32721).unwrap();
        let (e, n) = p.forward(-58.3816, -34.6037);
        assert_abs_diff_eq!(e, 373_317.50, epsilon = 1.0);
        assert_abs_diff_eq!(n, 6_170_036.17, epsilon = 1.0);
    }

    #[test]
    fn utm_roundtrip_greenland() {
        let p = Projection::from_epsg(32622).unwrap();
        for &(lon, lat) in &[(-51.0, 69.2), (-49.3, 67.0), (-53.9, 71.5)] {
            let (x, y) = p.forward(lon, lat);
            let (lon2, lat2) = p.inverse(x, y);
            assert_abs_diff_eq!(lon2, lon, epsilon = 1e-7);
            assert_abs_diff_eq!(lat2, lat, epsilon = 1e-7);
        }
    }

    #[test]
    fn polar_stereographic_true_scale_latitude() {
        // on the central meridian at the standard parallel, rho = a * m_c
        let p = Projection::from_epsg(3413).unwrap();
        let (x, y) = p.forward(-45.0, 70.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, -2_187_927.0, epsilon = 50.0);

        let (x, y) = p.forward(45.0, 90.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn polar_roundtrip_both_hemispheres() {
        for (code, pts) in [
            (3413u32, [(-50.0, 69.0), (-30.0, 80.0), (10.0, 65.0)]),
            (3031u32, [(0.0, -75.0), (120.0, -68.0), (-100.0, -85.0)]),
        ] {
            let p = Projection::from_epsg(code).unwrap();
            for &(lon, lat) in &pts {
                let (x, y) = p.forward(lon, lat);
                let (lon2, lat2) = p.inverse(x, y);
                assert_abs_diff_eq!(lon2, lon, epsilon = 1e-8);
                assert_abs_diff_eq!(lat2, lat, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn antarctic_axes() {
        // EPSG:3031: lon 90E lies along +x, lon 0 along +y
        let p = Projection::from_epsg(3031).unwrap();
        let (x, y) = p.forward(90.0, -75.0);
        assert!(x > 0.0);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
        let (x, y) = p.forward(0.0, -75.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert!(y > 0.0);
    }

    #[test]
    fn utm_zone_lookup() {
        assert_eq!(utm_epsg_for(-51.0, 69.0), 32622);
        assert_eq!(utm_epsg_for(-3.7, 40.4), 32630);
        assert_eq!(utm_epsg_for(-58.4, -34.6), 32721);
        assert_eq!(utm_epsg_for(180.0, 10.0), 32601);
    }
}
