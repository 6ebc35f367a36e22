//! GDAL-backed raster and vector I/O
//!
//! Opens everything GDAL does (Sentinel-2 JPEG2000 bands, ArcticDEM VRT
//! mosaics, GeoTIFF) and writes GeoPackage / Shapefile layers.

use super::{Compression, GeoTiffOptions, RasterInfo, VectorFormat};
use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, GridSpec, Raster, RasterElement, SampleFormat};
use crate::vector::{AttributeValue, FeatureCollection};
use gdal::raster::{Buffer, GdalType, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldValue, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType, ToGdal};
use gdal::{Dataset, DriverManager};
use std::path::Path;

fn crs_of(dataset: &Dataset) -> Option<CRS> {
    let srs = dataset.spatial_ref().ok()?;
    match srs.auth_code() {
        Ok(code) => Some(CRS::from_epsg(code as u32)),
        Err(_) => srs.to_wkt().ok().map(CRS::from_wkt),
    }
}

/// Read one band (1-indexed, default 1) into a raster of `T`
pub fn read_geotiff<T, P>(path: P, band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let dataset = Dataset::open(path.as_ref())?;
    let rasterband = dataset.rasterband(band.unwrap_or(1))?;
    let (cols, rows) = dataset.raster_size();

    let buffer = rasterband.read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)?;
    let (_, values) = buffer.into_shape_and_vec();
    let data = values
        .into_iter()
        .map(|v| T::from_f64(v).unwrap_or_else(T::default_nodata))
        .collect();

    let mut raster = Raster::from_vec(data, rows, cols)?;
    if let Ok(gt) = dataset.geo_transform() {
        raster.set_transform(GeoTransform::from_gdal(gt));
    }
    raster.set_crs(crs_of(&dataset));
    raster.set_nodata(rasterband.no_data_value().and_then(T::from_f64));
    Ok(raster)
}

pub fn read_geotiff_info<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    let dataset = Dataset::open(path.as_ref())?;
    let (cols, rows) = dataset.raster_size();
    let transform = dataset
        .geo_transform()
        .map(GeoTransform::from_gdal)
        .unwrap_or_default();
    let nodata = dataset.rasterband(1)?.no_data_value();
    Ok(RasterInfo {
        grid: GridSpec::new(crs_of(&dataset), transform, rows, cols),
        nodata,
    })
}

/// Write a raster as GeoTIFF through the GTiff driver
pub fn write_geotiff<T, P>(raster: &Raster<T>, path: P, options: Option<GeoTiffOptions>) -> Result<()>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let opts = options.unwrap_or_default();
    match T::FORMAT {
        SampleFormat::U8 => write_typed::<u8, T>(raster, path.as_ref(), &opts),
        SampleFormat::U16 => write_typed::<u16, T>(raster, path.as_ref(), &opts),
        SampleFormat::I16 => write_typed::<i16, T>(raster, path.as_ref(), &opts),
        SampleFormat::I32 => write_typed::<i32, T>(raster, path.as_ref(), &opts),
        SampleFormat::F32 => write_typed::<f32, T>(raster, path.as_ref(), &opts),
        SampleFormat::F64 => write_typed::<f64, T>(raster, path.as_ref(), &opts),
    }
}

fn write_typed<U, T>(raster: &Raster<T>, path: &Path, opts: &GeoTiffOptions) -> Result<()>
where
    U: GdalType + Copy + num_traits::NumCast,
    T: RasterElement,
{
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (rows, cols) = raster.shape();

    let mut create = RasterCreationOptions::new();
    if opts.compression == Compression::Deflate {
        create.add_name_value("COMPRESS", "DEFLATE")?;
    }
    create.add_name_value("TILED", "YES")?;

    let mut dataset = driver.create_with_band_type_with_options::<U, _>(path, cols, rows, 1, &create)?;
    dataset.set_geo_transform(&raster.transform().to_gdal())?;
    if let Some(crs) = raster.crs() {
        if let Some(srs) = spatial_ref(crs)? {
            dataset.set_spatial_ref(&srs)?;
        }
    }

    let mut band = dataset.rasterband(1)?;
    if let Some(nd) = raster.nodata().and_then(|v| v.to_f64()) {
        band.set_no_data_value(Some(nd))?;
    }

    let data: Vec<U> = raster
        .data()
        .iter()
        .map(|&v| num_traits::cast(v).ok_or_else(|| Error::UnsupportedDataType(format!("{:?}", v))))
        .collect::<Result<_>>()?;
    let mut buffer = Buffer::new((cols, rows), data);
    band.write((0, 0), (cols, rows), &mut buffer)?;
    Ok(())
}

fn spatial_ref(crs: &CRS) -> Result<Option<SpatialRef>> {
    if let Some(code) = crs.epsg() {
        return Ok(Some(SpatialRef::from_epsg(code)?));
    }
    match crs.wkt() {
        Some(wkt) => Ok(Some(SpatialRef::from_wkt(wkt)?)),
        None => Ok(None),
    }
}

/// Write polygons with their attributes as a GeoPackage or Shapefile layer
pub(crate) fn write_ogr(fc: &FeatureCollection, path: &Path, format: VectorFormat) -> Result<()> {
    let driver_name = match format {
        VectorFormat::Gpkg => "GPKG",
        VectorFormat::Shp => "ESRI Shapefile",
        VectorFormat::GeoJson => "GeoJSON",
    };
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let driver = DriverManager::get_driver_by_name(driver_name)?;
    let mut dataset = driver.create_vector_only(path)?;
    let srs = match &fc.crs {
        Some(crs) => spatial_ref(crs)?,
        None => None,
    };
    let layer_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("lakes");
    let mut layer = dataset.create_layer(LayerOptions {
        name: layer_name,
        srs: srs.as_ref(),
        ty: OGRwkbGeometryType::wkbPolygon,
        options: None,
    })?;

    let keys = fc.property_keys();
    let defs: Vec<(&str, OGRFieldType::Type)> = keys
        .iter()
        .map(|k| {
            let ty = match fc.iter().find_map(|f| f.get_property(k)) {
                Some(AttributeValue::Float(_)) => OGRFieldType::OFTReal,
                Some(AttributeValue::Int(_)) => OGRFieldType::OFTInteger64,
                _ => OGRFieldType::OFTString,
            };
            (k.as_str(), ty)
        })
        .collect();
    layer.create_defn_fields(&defs)?;

    for feature in fc.iter() {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (k, v) in &feature.properties {
            let value = match v {
                AttributeValue::Null => continue,
                AttributeValue::Bool(b) => FieldValue::IntegerValue(i32::from(*b)),
                AttributeValue::Int(i) => FieldValue::Integer64Value(*i),
                AttributeValue::Float(f) => FieldValue::RealValue(*f),
                AttributeValue::String(s) => FieldValue::StringValue(s.clone()),
            };
            names.push(k.as_str());
            values.push(value);
        }
        layer.create_feature_fields(geometry.to_gdal()?, &names, &values)?;
    }
    Ok(())
}
