//! MetaImage (`.mhd` + `.raw`, or `.mha`) reader, the single-file format of
//! the LUNA16 scans.

use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use flate2::read::ZlibDecoder;
use ndarray::Array3;

use crate::{
    volume::RawVolume,
    volume_loader::{VolumeLoaderError, VolumeSource, ensure_non_empty, hu_from_f32},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ElementType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "MET_CHAR" => ElementType::I8,
            "MET_UCHAR" => ElementType::U8,
            "MET_SHORT" => ElementType::I16,
            "MET_USHORT" => ElementType::U16,
            "MET_INT" | "MET_LONG" => ElementType::I32,
            "MET_UINT" | "MET_ULONG" => ElementType::U32,
            "MET_FLOAT" => ElementType::F32,
            "MET_DOUBLE" => ElementType::F64,
            _ => return None,
        })
    }

    fn size(&self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    fn decode(&self, bytes: &[u8], big_endian: bool) -> f32 {
        macro_rules! read {
            ($t:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                if big_endian {
                    <$t>::from_be_bytes(raw)
                } else {
                    <$t>::from_le_bytes(raw)
                }
            }};
        }
        match self {
            ElementType::I8 => bytes[0] as i8 as f32,
            ElementType::U8 => f32::from(bytes[0]),
            ElementType::I16 => f32::from(read!(i16, 2)),
            ElementType::U16 => f32::from(read!(u16, 2)),
            ElementType::I32 => read!(i32, 4) as f32,
            ElementType::U32 => read!(u32, 4) as f32,
            ElementType::F32 => read!(f32, 4),
            ElementType::F64 => read!(f64, 8) as f32,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataFile {
    /// Payload follows the header, starting at this byte offset.
    Local(usize),
    External(PathBuf),
}

/// The fields of a MetaImage header needed to read a 3-D scan.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaImageHeader {
    /// (x, y, z)
    pub dim_size: [usize; 3],
    /// (x, y, z)
    pub element_spacing: [f64; 3],
    /// (x, y, z)
    pub offset: Option<[f64; 3]>,
    pub element_type: ElementType,
    pub big_endian: bool,
    pub compressed: bool,
    pub data_file: DataFile,
}

fn header_error(message: impl Into<String>) -> VolumeLoaderError {
    VolumeLoaderError::MetaImageHeader(message.into())
}

fn parse_triple<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<Option<[T; 3]>, VolumeLoaderError> {
    let Some(value) = fields.get(key) else {
        return Ok(None);
    };
    let parsed = value
        .split_whitespace()
        .map(|v| v.parse::<T>().map_err(|_| header_error(format!("{key} = {value}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let triple: [T; 3] = parsed
        .try_into()
        .map_err(|_| header_error(format!("{key} must have three values")))?;
    Ok(Some(triple))
}

fn parse_bool(fields: &HashMap<String, String>, key: &str) -> bool {
    fields
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

impl MetaImageHeader {
    /// Parse the `Key = Value` header at the start of `bytes`. External data
    /// files are resolved against `dir`.
    pub fn parse(bytes: &[u8], dir: &Path) -> Result<Self, VolumeLoaderError> {
        let mut fields = HashMap::new();
        let mut consumed = 0;
        let mut data_file = None;

        for line in bytes.split_inclusive(|&b| b == b'\n') {
            consumed += line.len();
            let text = String::from_utf8_lossy(line);
            let Some((key, value)) = text.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key == "ElementDataFile" {
                data_file = Some(if value == "LOCAL" {
                    DataFile::Local(consumed)
                } else {
                    DataFile::External(dir.join(value))
                });
                break;
            }
            fields.insert(key.to_string(), value.to_string());
        }

        let data_file = data_file.ok_or_else(|| header_error("missing ElementDataFile"))?;

        if let Some(ndims) = fields.get("NDims") {
            if ndims != "3" {
                return Err(VolumeLoaderError::Unsupported(format!(
                    "MetaImage with NDims = {ndims}"
                )));
            }
        }
        if let Some(channels) = fields.get("ElementNumberOfChannels") {
            if channels != "1" {
                return Err(VolumeLoaderError::Unsupported(format!(
                    "MetaImage with {channels} channels"
                )));
            }
        }

        let dim_size = parse_triple::<usize>(&fields, "DimSize")?
            .ok_or_else(|| header_error("missing DimSize"))?;
        ensure_non_empty(&dim_size)?;
        let element_spacing = match parse_triple::<f64>(&fields, "ElementSpacing")? {
            Some(spacing) => spacing,
            None => parse_triple::<f64>(&fields, "ElementSize")?
                .ok_or(VolumeLoaderError::MissingSpacing)?,
        };
        let offset = match parse_triple::<f64>(&fields, "Offset")? {
            Some(offset) => Some(offset),
            None => parse_triple::<f64>(&fields, "Position")?,
        };
        let element_type = fields
            .get("ElementType")
            .ok_or_else(|| header_error("missing ElementType"))
            .and_then(|name| {
                ElementType::parse(name)
                    .ok_or_else(|| VolumeLoaderError::Unsupported(format!("element type {name}")))
            })?;
        let big_endian =
            parse_bool(&fields, "BinaryDataByteOrderMSB") || parse_bool(&fields, "ElementByteOrderMSB");

        Ok(Self {
            dim_size,
            element_spacing,
            offset,
            element_type,
            big_endian,
            compressed: parse_bool(&fields, "CompressedData"),
            data_file,
        })
    }

    fn voxel_count(&self) -> usize {
        self.dim_size.iter().product()
    }

    /// Decode the voxel payload into a (z, y, x) array.
    pub fn read_voxels(&self, header_bytes: &[u8]) -> Result<Array3<f32>, VolumeLoaderError> {
        let stored = match &self.data_file {
            DataFile::Local(offset) => header_bytes[*offset..].to_vec(),
            DataFile::External(path) => fs::read(path)?,
        };
        let payload = if self.compressed {
            let mut inflated = Vec::with_capacity(self.voxel_count() * self.element_type.size());
            ZlibDecoder::new(stored.as_slice()).read_to_end(&mut inflated)?;
            inflated
        } else {
            stored
        };

        let element_size = self.element_type.size();
        let expected = self.voxel_count() * element_size;
        if payload.len() < expected {
            return Err(header_error(format!(
                "expected {expected} bytes of voxel data, found {}",
                payload.len()
            )));
        }

        let values: Vec<f32> = payload[..expected]
            .chunks_exact(element_size)
            .map(|chunk| self.element_type.decode(chunk, self.big_endian))
            .collect();
        let [x, y, z] = self.dim_size;
        Ok(Array3::from_shape_vec((z, y, x), values)?)
    }
}

/// A MetaImage scan, either `.mhd` with a separate payload or `.mha`.
pub struct MetaImageSource;

impl VolumeSource for MetaImageSource {
    fn load(&self, path: &Path) -> Result<RawVolume, VolumeLoaderError> {
        let bytes = fs::read(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let header = MetaImageHeader::parse(&bytes, dir)?;
        let data = header.read_voxels(&bytes)?;

        let [sx, sy, sz] = header.element_spacing;
        Ok(RawVolume {
            data: hu_from_f32(data, path),
            spacing: [sz, sy, sx],
            origin: header.offset.map(|[ox, oy, oz]| [oz, oy, ox]),
            acquisition_exception: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::ZlibEncoder};
    use std::io::Write;
    use tempfile::TempDir;

    fn short_payload(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn mhd_with_raw_file_is_read_in_zyx_order() {
        let tmp = TempDir::new().unwrap();
        let values: Vec<i16> = (0..12).map(|v| v * 10 - 1000).collect();
        fs::write(tmp.path().join("scan.raw"), short_payload(&values)).unwrap();
        fs::write(
            tmp.path().join("scan.mhd"),
            "ObjectType = Image\nNDims = 3\nBinaryData = True\nBinaryDataByteOrderMSB = False\n\
             CompressedData = False\nOffset = -10 -20 -30\nElementSpacing = 0.5 0.75 2.5\n\
             DimSize = 3 2 2\nElementType = MET_SHORT\nElementDataFile = scan.raw\n",
        )
        .unwrap();

        let volume = MetaImageSource.load(&tmp.path().join("scan.mhd")).unwrap();

        assert_eq!(volume.dim(), (2, 2, 3));
        assert_eq!(volume.spacing, [2.5, 0.75, 0.5]);
        assert_eq!(volume.origin, Some([-30.0, -20.0, -10.0]));
        assert_eq!(volume.acquisition_exception, None);
        assert_eq!(volume.data[[0, 0, 1]], -990);
        assert_eq!(volume.data[[1, 0, 0]], -940);
        assert_eq!(volume.data[[1, 1, 2]], -890);
    }

    #[test]
    fn mha_with_local_compressed_payload() {
        let tmp = TempDir::new().unwrap();
        let values: Vec<i16> = vec![-1000, 0, 400, 1200];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&short_payload(&values)).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut bytes = b"NDims = 3\nCompressedData = True\nElementSpacing = 1 1 1\n\
                          DimSize = 2 2 1\nElementType = MET_SHORT\nElementDataFile = LOCAL\n"
            .to_vec();
        bytes.extend_from_slice(&compressed);
        let path = tmp.path().join("scan.mha");
        fs::write(&path, bytes).unwrap();

        let volume = MetaImageSource.load(&path).unwrap();

        assert_eq!(volume.dim(), (1, 2, 2));
        assert_eq!(volume.data.as_slice().unwrap(), &[-1000, 0, 400, 1200]);
        assert_eq!(volume.origin, None);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let header = MetaImageHeader::parse(
            b"DimSize = 4 4 4\nElementSpacing = 1 1 1\nElementType = MET_SHORT\nElementDataFile = LOCAL\n\x00\x00",
            Path::new("."),
        )
        .unwrap();
        let bytes = b"DimSize = 4 4 4\nElementSpacing = 1 1 1\nElementType = MET_SHORT\nElementDataFile = LOCAL\n\x00\x00";
        assert!(matches!(
            header.read_voxels(bytes),
            Err(VolumeLoaderError::MetaImageHeader(_))
        ));
    }

    #[test]
    fn empty_axis_is_rejected() {
        let header = MetaImageHeader::parse(
            b"DimSize = 0 4 4\nElementSpacing = 1 1 1\nElementType = MET_SHORT\nElementDataFile = LOCAL\n",
            Path::new("."),
        );
        assert!(matches!(header, Err(VolumeLoaderError::EmptyAxis(shape)) if shape == [0, 4, 4]));
    }

    #[test]
    fn big_endian_elements_are_swapped() {
        assert_eq!(ElementType::I16.decode(&[0xFC, 0x18], true), -1000.0);
        assert_eq!(ElementType::I16.decode(&[0x18, 0xFC], false), -1000.0);
    }
}
