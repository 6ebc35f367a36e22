//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate. Georeferencing is carried by the ModelPixelScale,
//! ModelTiepoint / ModelTransformation and GeoKeyDirectory tags; no-data by
//! the GDAL_NODATA ASCII tag. Only single-band rasters are handled.

use super::{Compression, GeoTiffOptions, RasterInfo};
use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, GridSpec, Raster, RasterElement, SampleFormat};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::{self as tiff_compression, Deflate, Uncompressed};
use tiff::encoder::{DirectoryEncoder, ImageEncoder, TiffEncoder, TiffKindStandard, TiffValue};
use tiff::tags::Tag;
use tiff::ColorType as PixelLayout;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

/// Read band 1 of a GeoTIFF, casting samples to `T`
pub fn read_geotiff<T, P>(path: P, band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    super::ensure_native_format(path)?;
    if band.unwrap_or(1) != 1 {
        return Err(Error::UnsupportedDataType(format!(
            "native reader only handles band 1 of {}",
            path.display()
        )));
    }
    let file = BufReader::new(File::open(path)?);
    decode_geotiff(file)
}

/// Grid and no-data of a GeoTIFF without decoding the pixels
pub fn read_geotiff_info<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    let path = path.as_ref();
    super::ensure_native_format(path)?;
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (width, height) = decoder.dimensions()?;
    let meta = read_geo_meta(&mut decoder);
    Ok(RasterInfo {
        grid: GridSpec::new(meta.crs, meta.transform, height as usize, width as usize),
        nodata: meta.nodata,
    })
}

fn decode_geotiff<T, R>(reader: R) -> Result<Raster<T>>
where
    T: RasterElement,
    R: Read + Seek,
{
    let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());

    match decoder.colortype()? {
        PixelLayout::Gray(_) => {}
        other => {
            return Err(Error::UnsupportedDataType(format!(
                "expected a single-band raster, found {:?}",
                other
            )))
        }
    }

    let (width, height) = decoder.dimensions()?;
    let (rows, cols) = (height as usize, width as usize);

    let data: Vec<T> = match decoder.read_image()? {
        DecodingResult::U8(buf) => cast_all(buf),
        DecodingResult::U16(buf) => cast_all(buf),
        DecodingResult::U32(buf) => cast_all(buf),
        DecodingResult::I8(buf) => cast_all(buf),
        DecodingResult::I16(buf) => cast_all(buf),
        DecodingResult::I32(buf) => cast_all(buf),
        DecodingResult::F32(buf) => cast_all(buf),
        DecodingResult::F64(buf) => cast_all(buf),
        _ => return Err(Error::UnsupportedDataType("64-bit integer TIFF samples".to_string())),
    };

    let mut raster = Raster::from_vec(data, rows, cols)?;
    let meta = read_geo_meta(&mut decoder);
    raster.set_transform(meta.transform);
    raster.set_crs(meta.crs);
    raster.set_nodata(meta.nodata.and_then(T::from_f64));
    Ok(raster)
}

fn cast_all<S: num_traits::NumCast + Copy, T: RasterElement>(buf: Vec<S>) -> Vec<T> {
    buf.into_iter()
        .map(|v| num_traits::cast(v).unwrap_or_else(T::default_nodata))
        .collect()
}

struct GeoMeta {
    transform: GeoTransform,
    crs: Option<CRS>,
    nodata: Option<f64>,
}

fn read_geo_meta<R: Read + Seek>(decoder: &mut Decoder<R>) -> GeoMeta {
    GeoMeta {
        transform: read_geotransform(decoder).unwrap_or_default(),
        crs: read_crs(decoder),
        nodata: read_nodata(decoder),
    }
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();

    if let (Some(scale), Some(tie)) = (&scale, &tiepoint) {
        if scale.len() >= 2 && tie.len() >= 6 {
            // tiepoint [I, J, K, X, Y, Z] pins raster (I, J) to map (X, Y)
            return Some(GeoTransform::new(
                tie[3] - tie[0] * scale[0],
                tie[4] + tie[1] * scale[1],
                scale[0],
                -scale[1],
            ));
        }
    }

    // 4x4 row-major matrix
    let m = decoder.get_tag_f64_vec(Tag::ModelTransformationTag).ok()?;
    (m.len() >= 16).then(|| GeoTransform {
        origin_x: m[3],
        origin_y: m[7],
        pixel_width: m[0],
        pixel_height: m[5],
        row_rotation: m[1],
        col_rotation: m[4],
    })
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<CRS> {
    let keys = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok()?;
    if keys.len() < 4 {
        return None;
    }
    let n = keys[3] as usize;
    let mut geographic = None;
    for entry in keys[4..].chunks_exact(4).take(n) {
        let (id, location, value) = (entry[0], entry[1], entry[3]);
        // location 0 means the value is stored inline
        if location != 0 || value == 0 || value == 32767 {
            continue;
        }
        match id {
            PROJECTED_CS_TYPE => return Some(CRS::from_epsg(value as u32)),
            GEOGRAPHIC_TYPE => geographic = Some(CRS::from_epsg(value as u32)),
            _ => {}
        }
    }
    geographic
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let s = decoder.get_tag_ascii_string(Tag::GdalNodata).ok()?;
    let s = s.trim_matches(char::from(0)).trim();
    match s.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        _ => s.parse::<f64>().ok(),
    }
}

/// Write a raster as a single-band GeoTIFF in the sample format of `T`
pub fn write_geotiff<T, P>(raster: &Raster<T>, path: P, options: Option<GeoTiffOptions>) -> Result<()>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let opts = options.unwrap_or_default();
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    encode_geotiff(raster, &mut out, &opts)?;
    out.flush()?;
    Ok(())
}

fn encode_geotiff<T, W>(raster: &Raster<T>, writer: W, opts: &GeoTiffOptions) -> Result<()>
where
    T: RasterElement,
    W: Write + Seek,
{
    let mut encoder = TiffEncoder::new(writer)?;
    let tags = GeoTags::for_raster(raster);

    match T::FORMAT {
        SampleFormat::U8 => encode_as::<colortype::Gray8, _, _>(&mut encoder, raster, &tags, opts),
        SampleFormat::U16 => encode_as::<colortype::Gray16, _, _>(&mut encoder, raster, &tags, opts),
        SampleFormat::I16 => encode_as::<colortype::GrayI16, _, _>(&mut encoder, raster, &tags, opts),
        SampleFormat::I32 => encode_as::<colortype::GrayI32, _, _>(&mut encoder, raster, &tags, opts),
        SampleFormat::F32 => encode_as::<colortype::Gray32Float, _, _>(&mut encoder, raster, &tags, opts),
        SampleFormat::F64 => encode_as::<colortype::Gray64Float, _, _>(&mut encoder, raster, &tags, opts),
    }
}

fn encode_as<C, T, W>(
    encoder: &mut TiffEncoder<W>,
    raster: &Raster<T>,
    tags: &GeoTags,
    opts: &GeoTiffOptions,
) -> Result<()>
where
    C: ColorType,
    C::Inner: num_traits::NumCast + Copy,
    [C::Inner]: TiffValue,
    T: RasterElement,
    W: Write + Seek,
{
    let (rows, cols) = raster.shape();
    let data: Vec<C::Inner> = raster
        .data()
        .iter()
        .map(|&v| num_traits::cast(v).ok_or_else(|| Error::UnsupportedDataType(format!("{:?}", v))))
        .collect::<Result<_>>()?;

    match opts.compression {
        Compression::None => {
            let image = encoder.new_image_with_compression::<C, _>(cols as u32, rows as u32, Uncompressed)?;
            finish_image(image, tags, &data)
        }
        Compression::Deflate => {
            let image = encoder.new_image_with_compression::<C, _>(cols as u32, rows as u32, Deflate::default())?;
            finish_image(image, tags, &data)
        }
    }
}

fn finish_image<W, C, D>(
    mut image: ImageEncoder<'_, W, C, TiffKindStandard, D>,
    tags: &GeoTags,
    data: &[C::Inner],
) -> Result<()>
where
    W: Write + Seek,
    C: ColorType,
    D: tiff_compression::Compression,
    [C::Inner]: TiffValue,
{
    tags.write(image.encoder())?;
    image.write_data(data)?;
    Ok(())
}

/// GeoTIFF tags derived from a raster's georeferencing
struct GeoTags {
    scale: [f64; 3],
    tiepoint: [f64; 6],
    matrix: Option<[f64; 16]>,
    geokeys: Vec<u16>,
    nodata: Option<String>,
}

impl GeoTags {
    fn for_raster<T: RasterElement>(raster: &Raster<T>) -> Self {
        let gt = raster.transform();
        let matrix = (!gt.is_north_up()).then(|| {
            [
                gt.pixel_width, gt.row_rotation, 0.0, gt.origin_x,
                gt.col_rotation, gt.pixel_height, 0.0, gt.origin_y,
                0.0, 0.0, 0.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ]
        });

        let mut keys: Vec<[u16; 4]> = Vec::new();
        let epsg = raster.crs().and_then(|c| c.epsg()).filter(|&c| c <= u16::MAX as u32);
        let geographic = raster.crs().map_or(false, |c| c.is_geographic());
        keys.push([GT_MODEL_TYPE, 0, 1, if geographic { 2 } else { 1 }]);
        keys.push([GT_RASTER_TYPE, 0, 1, 1]);
        if let Some(code) = epsg {
            let key = if geographic { GEOGRAPHIC_TYPE } else { PROJECTED_CS_TYPE };
            keys.push([key, 0, 1, code as u16]);
        }
        let mut geokeys = vec![1, 1, 0, keys.len() as u16];
        geokeys.extend(keys.into_iter().flatten());

        let nodata = raster.nodata().and_then(|v| v.to_f64()).map(|v| {
            if v.is_nan() {
                "nan".to_string()
            } else {
                format!("{}", v)
            }
        });

        Self {
            scale: [gt.pixel_width, gt.pixel_height.abs(), 0.0],
            tiepoint: [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0],
            matrix,
            geokeys,
            nodata,
        }
    }

    fn write<W: Write + Seek>(&self, dir: &mut DirectoryEncoder<'_, W, TiffKindStandard>) -> Result<()> {
        match &self.matrix {
            Some(m) => dir.write_tag(Tag::ModelTransformationTag, &m[..])?,
            None => {
                dir.write_tag(Tag::ModelPixelScaleTag, &self.scale[..])?;
                dir.write_tag(Tag::ModelTiepointTag, &self.tiepoint[..])?;
            }
        }
        dir.write_tag(Tag::GeoKeyDirectoryTag, &self.geokeys[..])?;
        if let Some(nd) = &self.nodata {
            dir.write_tag(Tag::GdalNodata, nd.as_str())?;
        }
        Ok(())
    }
}
