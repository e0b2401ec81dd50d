//! Native GeoTIFF reading/writing
//!
//! Uses the `tiff` crate. Every band is stored as its own TIFF page of
//! 64-bit float samples, with the band name in the ImageDescription tag and
//! the no-data sentinel in the GDAL_NODATA tag. Masked (NaN) pixels are
//! written as the sentinel and read back as NaN. Key/value metadata travels
//! in the GDAL_METADATA tag as GDAL's `<GDALMetadata>` XML.

use crate::error::{Error, Result};
use crate::raster::{GeoTransform, GridSpec, Raster};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::Gray64Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

/// GDAL_METADATA; the tiff crate has no named variant for it
const TAG_GDAL_METADATA: u16 = 42112;

/// Options for writing GeoTIFF files
#[derive(Debug, Clone, PartialEq)]
pub struct GeoTiffOptions {
    /// Value substituted for masked pixels; `None` keeps NaN on disk
    pub nodata: Option<f64>,
    /// Key/value pairs written to every page
    pub metadata: Vec<(String, String)>,
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self {
            nodata: Some(-9999.0),
            metadata: Vec::new(),
        }
    }
}

/// A named band as read from disk
#[derive(Debug, Clone)]
pub struct NamedBand {
    pub name: String,
    pub raster: Raster<f64>,
    pub metadata: BTreeMap<String, String>,
}

/// Read one band (0-based page index, default first) of a GeoTIFF file
pub fn read_geotiff<P: AsRef<Path>>(path: P, band: Option<usize>) -> Result<Raster<f64>> {
    let index = band.unwrap_or(0);
    read_geotiff_bands(path)?
        .into_iter()
        .nth(index)
        .map(|b| b.raster)
        .ok_or_else(|| Error::InvalidParameter {
            name: "band",
            value: index.to_string(),
            reason: "band index beyond the pages of the file".to_string(),
        })
}

/// Read every band of a GeoTIFF file
pub fn read_geotiff_bands<P: AsRef<Path>>(path: P) -> Result<Vec<NamedBand>> {
    let file = BufReader::new(File::open(path.as_ref())?);
    decode_bands(file)
}

/// Read every band of an in-memory GeoTIFF
pub fn read_geotiff_from_buffer(data: &[u8]) -> Result<Vec<NamedBand>> {
    decode_bands(Cursor::new(data))
}

/// Band names of a GeoTIFF file, without decoding pixel data
pub fn read_band_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let file = BufReader::new(File::open(path.as_ref())?);
    let mut decoder = Decoder::new(file)?;
    let mut names = Vec::new();
    loop {
        names.push(band_name(&mut decoder, names.len()));
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    Ok(names)
}

/// Grid of the first page of a GeoTIFF file, without decoding pixel data
pub fn read_grid<P: AsRef<Path>>(path: P) -> Result<GridSpec> {
    let file = BufReader::new(File::open(path.as_ref())?);
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let transform = read_geotransform(&mut decoder).unwrap_or_default();
    Ok(GridSpec::new(height as usize, width as usize, transform))
}

fn band_name<R: Read + Seek>(decoder: &mut Decoder<R>, index: usize) -> String {
    decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .ok()
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("band_{}", index + 1))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim_end_matches('\0').trim().parse::<f64>().ok())
}

fn read_metadata<R: Read + Seek>(decoder: &mut Decoder<R>) -> BTreeMap<String, String> {
    decoder
        .get_tag_ascii_string(Tag::Unknown(TAG_GDAL_METADATA))
        .map(|xml| parse_metadata(&xml))
        .unwrap_or_default()
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_xml(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

fn format_metadata(items: &[(String, String)]) -> String {
    let mut xml = String::from("<GDALMetadata>");
    for (key, value) in items {
        xml.push_str(&format!(
            "<Item name=\"{}\">{}</Item>",
            escape_xml(key),
            escape_xml(value)
        ));
    }
    xml.push_str("</GDALMetadata>");
    xml
}

/// Items of a `<GDALMetadata>` document; attributes other than `name` are ignored
fn parse_metadata(xml: &str) -> BTreeMap<String, String> {
    let mut items = BTreeMap::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Item ") {
        rest = &rest[start..];
        let Some(open_end) = rest.find('>') else { break };
        let Some(close) = rest.find("</Item>") else { break };
        if close < open_end {
            break;
        }
        let attrs = &rest[..open_end];
        let name = attrs
            .split("name=\"")
            .nth(1)
            .and_then(|a| a.split('"').next());
        if let Some(name) = name {
            items.insert(unescape_xml(name), unescape_xml(&rest[open_end + 1..close]));
        }
        rest = &rest[close + "</Item>".len()..];
    }
    items
}

fn decode_bands<R: Read + Seek>(reader: R) -> Result<Vec<NamedBand>> {
    let mut decoder = Decoder::new(reader)?;
    let mut bands = Vec::new();
    let mut transform = None;

    loop {
        let (width, height) = decoder.dimensions()?;
        let (rows, cols) = (height as usize, width as usize);
        let name = band_name(&mut decoder, bands.len());
        let nodata = read_nodata(&mut decoder);
        let metadata = read_metadata(&mut decoder);
        if transform.is_none() {
            transform = read_geotransform(&mut decoder).ok();
        }

        let data: Vec<f64> = match decoder.read_image()? {
            DecodingResult::F64(buf) => buf,
            DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
            DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
            _ => return Err(Error::Tiff("unsupported TIFF sample format".to_string())),
        };

        let data = match nodata {
            Some(nd) if !nd.is_nan() => data
                .into_iter()
                .map(|v| if v == nd { f64::NAN } else { v })
                .collect(),
            _ => data,
        };

        let mut raster = Raster::from_vec(data, rows, cols)?;
        raster.set_transform(transform.unwrap_or_default());
        raster.set_nodata(Some(f64::NAN));
        bands.push(NamedBand { name, raster, metadata });

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    Ok(bands)
}

/// Read ModelPixelScale + ModelTiepoint tags
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .map_err(|_| Error::Tiff("no pixel scale tag".into()))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .map_err(|_| Error::Tiff("no tiepoint tag".into()))?;

    if scale.len() >= 2 && tiepoint.len() >= 6 {
        // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
        return Ok(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
    }

    Err(Error::Tiff("cannot determine geotransform".into()))
}

/// Write named bands of equal shape to a multi-page GeoTIFF file
pub fn write_geotiff<P: AsRef<Path>>(
    bands: &[(&str, &Raster<f64>)],
    path: P,
    options: &GeoTiffOptions,
) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    encode_bands(bands, &mut writer, options)?;
    writer.flush()?;
    Ok(())
}

/// Write named bands to an in-memory GeoTIFF
pub fn write_geotiff_to_buffer(bands: &[(&str, &Raster<f64>)], options: &GeoTiffOptions) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_bands(bands, Cursor::new(&mut buf), options)?;
    Ok(buf)
}

fn encode_bands<W: Write + Seek>(
    bands: &[(&str, &Raster<f64>)],
    writer: W,
    options: &GeoTiffOptions,
) -> Result<()> {
    let Some((_, first)) = bands.first() else {
        return Err(Error::InvalidParameter {
            name: "bands",
            value: "[]".to_string(),
            reason: "at least one band is required".to_string(),
        });
    };
    let (rows, cols) = first.shape();
    let gt = *first.transform();
    let nodata_text = options.nodata.map(|nd| nd.to_string());
    let metadata_xml = (!options.metadata.is_empty()).then(|| format_metadata(&options.metadata));

    let mut encoder = TiffEncoder::new(writer)?;

    for (name, raster) in bands {
        raster.ensure_shape(rows, cols)?;

        let data: Vec<f64> = raster
            .data()
            .iter()
            .map(|&v| match options.nodata {
                Some(nd) if raster.is_nodata(v) => nd,
                _ => v,
            })
            .collect();

        let mut image = encoder.new_image::<Gray64Float>(cols as u32, rows as u32)?;
        image.encoder().write_tag(Tag::ImageDescription, *name)?;

        let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;

        let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;

        // GTModelTypeGeoKey = Projected, GTRasterTypeGeoKey = PixelIsArea
        let geokeys: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 1, 1025, 0, 1, 1];
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])?;

        if let Some(text) = &nodata_text {
            image
                .encoder()
                .write_tag(Tag::GdalNodata, text.as_str())?;
        }
        if let Some(xml) = &metadata_xml {
            image
                .encoder()
                .write_tag(Tag::Unknown(TAG_GDAL_METADATA), xml.as_str())?;
        }

        image.write_data(&data)?;
    }

    Ok(())
}
