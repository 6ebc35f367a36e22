//! Coordinate Reference System handling

mod projection;
mod transform;

pub use projection::{utm_epsg_for, Projection};
pub use transform::{transform_bounds, transform_point, Transformer, DEFAULT_DENSIFY_PTS};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coordinate Reference System, identified by EPSG code or WKT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRS {
    wkt: Option<String>,
    epsg: Option<u32>,
}

impl CRS {
    pub fn from_epsg(code: u32) -> Self {
        Self {
            wkt: None,
            epsg: Some(code),
        }
    }

    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self {
            wkt: Some(wkt.into()),
            epsg: None,
        }
    }

    /// WGS84 geographic (EPSG:4326)
    pub fn wgs84() -> Self {
        Self::from_epsg(4326)
    }

    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }

    /// Projection math for this CRS, when the EPSG code is one we implement
    pub fn projection(&self) -> Result<Projection> {
        match self.epsg {
            Some(code) => Projection::from_epsg(code),
            None => Err(Error::UnsupportedCrs(self.identifier())),
        }
    }

    /// Whether coordinates are longitude/latitude degrees
    pub fn is_geographic(&self) -> bool {
        matches!(self.projection(), Ok(Projection::Geographic))
    }

    /// Whether coordinates are metres in a supported projected CRS
    pub fn is_metric(&self) -> bool {
        matches!(self.projection(), Ok(p) if !matches!(p, Projection::Geographic))
    }

    /// Two CRS are equivalent when their EPSG codes or WKT strings match
    pub fn is_equivalent(&self, other: &CRS) -> bool {
        if let (Some(a), Some(b)) = (self.epsg, other.epsg) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.wkt, &other.wkt) {
            return a == b;
        }
        false
    }

    /// `EPSG:xxxx` when known, otherwise a WKT prefix
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg {
            return format!("EPSG:{}", code);
        }
        if let Some(wkt) = &self.wkt {
            let head: String = wkt.chars().take(50).collect();
            return format!("WKT:{}", head);
        }
        "Unknown".to_string()
    }
}

impl FromStr for CRS {
    type Err = Error;

    /// Accepts `EPSG:32622`, `epsg:3413` or a bare code
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let code = s
            .split_once(':')
            .map_or(s, |(auth, code)| if auth.eq_ignore_ascii_case("epsg") { code } else { "" });
        code.trim()
            .parse::<u32>()
            .map(CRS::from_epsg)
            .map_err(|_| Error::InvalidParameter {
                name: "crs",
                value: s.to_string(),
                reason: "expected EPSG:<code>".to_string(),
            })
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl Default for CRS {
    fn default() -> Self {
        Self::wgs84()
    }
}
