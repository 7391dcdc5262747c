//! Minimal NIfTI-1 reader for single-file images (`.nii`, `.nii.gz`).

use std::fs;
use std::io::Read;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use ndarray::{Array3, Array4, ShapeBuilder};

use crate::error::KiraError;

const HEADER_SIZE: usize = 348;

/// A 4-D functional scan, `[X, Y, Z, T]`, with its repetition time in seconds.
#[derive(Debug, Clone)]
pub struct Scan {
    pub data: Array4<f32>,
    pub tr: f64,
}

impl Scan {
    pub fn new(data: Array4<f32>, tr: f64) -> Self {
        Self { data, tr }
    }

    pub fn total_volumes(&self) -> usize {
        self.data.dim().3
    }

    pub fn spatial_shape(&self) -> (usize, usize, usize) {
        let (x, y, z, _) = self.data.dim();
        (x, y, z)
    }
}

/// Voxel-wise region labels; 0 and negative values are background.
#[derive(Debug, Clone)]
pub struct Atlas {
    labels: Array3<i32>,
    regions: Vec<i32>,
}

impl Atlas {
    pub fn new(labels: Array3<i32>) -> Self {
        let mut regions = labels
            .iter()
            .copied()
            .filter(|label| *label > 0)
            .collect::<Vec<_>>();
        regions.sort_unstable();
        regions.dedup();
        Self { labels, regions }
    }

    pub fn labels(&self) -> &Array3<i32> {
        &self.labels
    }

    /// Sorted distinct region ids.
    pub fn regions(&self) -> &[i32] {
        &self.regions
    }
}

pub trait ScanLoader: Send + Sync {
    fn load_scan(&self, path: &Path) -> Result<Scan, KiraError>;
    fn load_atlas(&self, path: &Path) -> Result<Atlas, KiraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiLoader;

impl ScanLoader for NiftiLoader {
    fn load_scan(&self, path: &Path) -> Result<Scan, KiraError> {
        let (header, bytes) = read_header(path)?;
        let shape = match header.dims.as_slice() {
            [x, y, z, t] if *t > 0 => (*x, *y, *z, *t),
            dims => {
                return Err(KiraError::unreadable(
                    path,
                    format!("expected a non-empty 4-D image, got dims {dims:?}"),
                ));
            }
        };
        let data = decode_voxels(&header, &bytes)
            .map_err(|reason| KiraError::unreadable(path, reason))?;
        let data = Array4::from_shape_vec(shape.f(), data)
            .map_err(|err| KiraError::unreadable(path, err))?;
        Ok(Scan::new(data, header.tr_secs()))
    }

    fn load_atlas(&self, path: &Path) -> Result<Atlas, KiraError> {
        let (header, bytes) = read_header(path)?;
        let shape = match header.dims.as_slice() {
            [x, y, z] | [x, y, z, 1] => (*x, *y, *z),
            dims => {
                return Err(KiraError::AtlasUnavailable(format!(
                    "{}: expected a 3-D label image, got dims {dims:?}",
                    path.display()
                )));
            }
        };
        let labels = decode_voxels(&header, &bytes)
            .map_err(|reason| KiraError::AtlasUnavailable(format!("{}: {reason}", path.display())))?
            .iter()
            .map(|value| value.round() as i32)
            .collect::<Vec<_>>();
        let labels = Array3::from_shape_vec(shape.f(), labels)
            .map_err(|err| KiraError::AtlasUnavailable(err.to_string()))?;
        Ok(Atlas::new(labels))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dims: Vec<usize>,
    pub datatype: i16,
    pub pixdim_t: f32,
    pub vox_offset: usize,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub xyzt_units: u8,
    pub big_endian: bool,
}

impl NiftiHeader {
    /// Repetition time in seconds, honoring the temporal unit code.
    pub fn tr_secs(&self) -> f64 {
        let value = f64::from(self.pixdim_t);
        match self.xyzt_units & 0x38 {
            16 => value / 1_000.0,
            24 => value / 1_000_000.0,
            _ => value,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("header truncated at {} bytes", bytes.len()));
        }
        let big_endian = match LittleEndian::read_i32(bytes) {
            348 => false,
            _ if BigEndian::read_i32(bytes) == 348 => true,
            other => return Err(format!("bad sizeof_hdr {other}")),
        };
        if &bytes[344..347] != b"n+1" {
            return Err("only single-file NIfTI-1 images are supported".to_string());
        }
        let reader = FieldReader { bytes, big_endian };

        let ndim = reader.i16(40);
        if !(1..=7).contains(&ndim) {
            return Err(format!("bad dim[0] {ndim}"));
        }
        let mut dims = Vec::with_capacity(ndim as usize);
        for axis in 1..=ndim as usize {
            let extent = reader.i16(40 + 2 * axis);
            if extent < 0 {
                return Err(format!("negative extent on axis {axis}"));
            }
            dims.push(extent as usize);
        }

        let vox_offset = reader.f32(108);
        if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
            return Err(format!("bad vox_offset {vox_offset}"));
        }

        Ok(Self {
            dims,
            datatype: reader.i16(70),
            pixdim_t: reader.f32(76 + 4 * 4),
            vox_offset: vox_offset as usize,
            scl_slope: reader.f32(112),
            scl_inter: reader.f32(116),
            xyzt_units: bytes[123],
            big_endian,
        })
    }

    /// Total voxel count, or `None` when the extents overflow.
    pub fn voxel_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |count, extent| count.checked_mul(*extent))
    }
}

/// Reads and parses the header; voxels stay undecoded until the caller has
/// accepted the dimensions.
fn read_header(path: &Path) -> Result<(NiftiHeader, Vec<u8>), KiraError> {
    let raw = fs::read(path).map_err(|err| KiraError::unreadable(path, err))?;
    let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|err| KiraError::unreadable(path, err))?;
        decoded
    } else {
        raw
    };

    let header =
        NiftiHeader::parse(&bytes).map_err(|reason| KiraError::unreadable(path, reason))?;
    Ok((header, bytes))
}

fn decode_voxels(header: &NiftiHeader, bytes: &[u8]) -> Result<Vec<f32>, String> {
    let count = header
        .voxel_count()
        .ok_or_else(|| format!("image extents {:?} overflow", header.dims))?;
    if count == 0 {
        return Err("image has no voxels".to_string());
    }
    let width = match header.datatype {
        2 | 256 => 1,
        4 | 512 => 2,
        8 | 16 | 768 => 4,
        64 => 8,
        other => return Err(format!("unsupported datatype {other}")),
    };
    let size = count
        .checked_mul(width)
        .ok_or_else(|| format!("image extents {:?} overflow", header.dims))?;
    let payload = bytes
        .get(header.vox_offset..)
        .filter(|payload| payload.len() >= size)
        .ok_or_else(|| format!("voxel data truncated, expected {size} bytes"))?;

    let apply_scale = header.scl_slope != 0.0 && header.scl_slope.is_finite();
    let data = payload[..size]
        .chunks_exact(width)
        .map(|raw| {
            let value = if header.big_endian {
                decode_as::<BigEndian>(header.datatype, raw)
            } else {
                decode_as::<LittleEndian>(header.datatype, raw)
            };
            if apply_scale {
                value * header.scl_slope + header.scl_inter
            } else {
                value
            }
        })
        .collect();
    Ok(data)
}

/// One voxel; `raw` is exactly one datatype width long.
fn decode_as<B: ByteOrder>(datatype: i16, raw: &[u8]) -> f32 {
    match datatype {
        2 => f32::from(raw[0]),
        256 => f32::from(raw[0] as i8),
        4 => f32::from(B::read_i16(raw)),
        512 => f32::from(B::read_u16(raw)),
        8 => B::read_i32(raw) as f32,
        768 => B::read_u32(raw) as f32,
        16 => B::read_f32(raw),
        _ => B::read_f64(raw) as f32,
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl FieldReader<'_> {
    fn i16(&self, offset: usize) -> i16 {
        let raw = &self.bytes[offset..];
        if self.big_endian {
            BigEndian::read_i16(raw)
        } else {
            LittleEndian::read_i16(raw)
        }
    }

    fn f32(&self, offset: usize) -> f32 {
        let raw = &self.bytes[offset..];
        if self.big_endian {
            BigEndian::read_f32(raw)
        } else {
            LittleEndian::read_f32(raw)
        }
    }
}
