//! Feature collection I/O: GeoJSON natively, GeoPackage and Shapefile via GDAL

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::vector::{AttributeValue, Feature, FeatureCollection};
use geojson::{feature::Id, JsonObject, JsonValue};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Output vector formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorFormat {
    GeoJson,
    Gpkg,
    Shp,
}

impl VectorFormat {
    /// File extension without the dot
    pub fn extension(self) -> &'static str {
        match self {
            VectorFormat::GeoJson => "geojson",
            VectorFormat::Gpkg => "gpkg",
            VectorFormat::Shp => "shp",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()?.to_str()?.parse().ok()
    }
}

impl FromStr for VectorFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "geojson" | "json" => Ok(VectorFormat::GeoJson),
            "gpkg" => Ok(VectorFormat::Gpkg),
            "shp" => Ok(VectorFormat::Shp),
            other => Err(Error::InvalidParameter {
                name: "ext",
                value: other.to_string(),
                reason: "expected geojson, gpkg or shp".to_string(),
            }),
        }
    }
}

/// Write features in the format implied by the path extension
pub fn write_vector<P: AsRef<Path>>(fc: &FeatureCollection, path: P) -> Result<()> {
    let path = path.as_ref();
    match VectorFormat::from_path(path) {
        Some(VectorFormat::GeoJson) => write_geojson(fc, path),
        #[cfg(feature = "gdal")]
        Some(fmt @ (VectorFormat::Gpkg | VectorFormat::Shp)) => super::gdal_io::write_ogr(fc, path, fmt),
        _ => Err(Error::UnsupportedFormat(path.display().to_string())),
    }
}

/// Write a GeoJSON FeatureCollection. The CRS, when known, is recorded in
/// the legacy `crs` member so GDAL and QGIS pick it up.
pub fn write_geojson<P: AsRef<Path>>(fc: &FeatureCollection, path: P) -> Result<()> {
    let features = fc
        .features
        .iter()
        .map(|f| geojson::Feature {
            bbox: None,
            geometry: f.geometry.as_ref().map(|g| geojson::Geometry::new(geojson::Value::from(g))),
            id: f.id.clone().map(Id::String),
            properties: Some(
                f.properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<JsonObject>(),
            ),
            foreign_members: None,
        })
        .collect();

    let foreign_members = fc.crs.as_ref().and_then(|c| c.epsg()).map(|code| {
        let mut members = JsonObject::new();
        members.insert(
            "crs".to_string(),
            serde_json::json!({
                "type": "name",
                "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", code) }
            }),
        );
        members
    });

    let out = geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members,
    };

    let mut w = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer(&mut w, &out)?;
    w.flush()?;
    Ok(())
}

/// Read a GeoJSON FeatureCollection; the CRS comes from a legacy `crs`
/// member and defaults to WGS84 as RFC 7946 prescribes.
pub fn read_geojson<P: AsRef<Path>>(path: P) -> Result<FeatureCollection> {
    let rdr = BufReader::new(File::open(path.as_ref())?);
    let fc: geojson::FeatureCollection = serde_json::from_reader(rdr)?;

    let crs = fc
        .foreign_members
        .as_ref()
        .and_then(|m| m.get("crs"))
        .and_then(crs_from_member)
        .unwrap_or_else(CRS::wgs84);

    let mut out = FeatureCollection::new(Some(crs));
    for f in fc.features {
        let geometry = match &f.geometry {
            Some(g) => Some(geo_types::Geometry::<f64>::try_from(&g.value)?),
            None => None,
        };
        let id = f.id.as_ref().map(|id| match id {
            Id::String(s) => s.clone(),
            Id::Number(n) => n.to_string(),
        });
        let properties = f
            .properties
            .as_ref()
            .map(|p| p.iter().map(|(k, v)| (k.clone(), AttributeValue::from_json(v))).collect())
            .unwrap_or_default();
        out.push(Feature {
            geometry,
            properties,
            id,
        });
    }
    Ok(out)
}

/// `urn:ogc:def:crs:EPSG::3413`, `EPSG:3413` or `urn:ogc:def:crs:OGC:1.3:CRS84`
fn crs_from_member(v: &JsonValue) -> Option<CRS> {
    let name = v.get("properties")?.get("name")?.as_str()?;
    if name.ends_with("CRS84") {
        return Some(CRS::wgs84());
    }
    let code = name.rsplit(':').next()?;
    code.parse::<u32>().ok().map(CRS::from_epsg)
}
