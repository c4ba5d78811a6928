use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::enums::StorageType;

/// Voxel data in (depth, row, column) order, in one of the two storage
/// representations.
#[derive(Clone, Debug, PartialEq)]
pub enum VoxelArray {
    Int16(Array3<i16>),
    Float32(Array3<f32>),
}

impl VoxelArray {
    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            VoxelArray::Int16(data) => data.dim(),
            VoxelArray::Float32(data) => data.dim(),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            VoxelArray::Int16(_) => StorageType::Int16,
            VoxelArray::Float32(_) => StorageType::Float32,
        }
    }

    /// Convert into the requested representation. Float to integer rounds
    /// and saturates.
    pub fn into_storage(self, storage: StorageType) -> Self {
        match (self, storage) {
            (VoxelArray::Int16(data), StorageType::Float32) => {
                VoxelArray::Float32(data.mapv(f32::from))
            }
            (VoxelArray::Float32(data), StorageType::Int16) => {
                VoxelArray::Int16(data.mapv(|v| v.round() as i16))
            }
            (same, _) => same,
        }
    }

    /// Axial slice `index` widened to `f32`.
    pub fn slice_f32(&self, index: usize) -> Array2<f32> {
        match self {
            VoxelArray::Int16(data) => data.index_axis(Axis(0), index).mapv(f32::from),
            VoxelArray::Float32(data) => data.index_axis(Axis(0), index).to_owned(),
        }
    }

    /// Iterate over every voxel as `f64`.
    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            VoxelArray::Int16(data) => Box::new(data.iter().map(|&v| f64::from(v))),
            VoxelArray::Float32(data) => Box::new(data.iter().map(|&v| f64::from(v))),
        }
    }
}

/// Diagnostic attached to a patient whose slice metadata had to be repaired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionException {
    /// Several acquisition numbers in one series; only `selected` was kept.
    MultipleAcquisitions {
        acquisition_numbers: Vec<String>,
        counts: Vec<usize>,
        selected: String,
    },
    /// No slice carried an acquisition number.
    MissingAcquisitionNumber,
}

/// A scan as loaded from disk, in Hounsfield units.
#[derive(Clone, Debug)]
pub struct RawVolume {
    pub data: Array3<i16>,
    /// Millimetres per voxel, (z, y, x).
    pub spacing: [f64; 3],
    /// World position of the first voxel, (z, y, x). Unknown for DICOM series.
    pub origin: Option<[f64; 3]>,
    pub acquisition_exception: Option<AcquisitionException>,
}

impl RawVolume {
    pub fn new(data: Array3<i16>, spacing: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin: None,
            acquisition_exception: None,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Physical size of the scan in millimetres, (z, y, x).
    pub fn extent(&self) -> [f64; 3] {
        physical_extent(self.dim(), self.spacing)
    }
}

/// A scan resampled to a uniform spacing, keeping what is needed to map
/// coordinates back to the raw scan.
#[derive(Clone, Debug)]
pub struct ResampledVolume {
    pub data: VoxelArray,
    pub spacing: [f64; 3],
    pub raw_shape: (usize, usize, usize),
    pub raw_spacing: [f64; 3],
    pub raw_origin: Option<[f64; 3]>,
    pub acquisition_exception: Option<AcquisitionException>,
}

impl ResampledVolume {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn extent(&self) -> [f64; 3] {
        physical_extent(self.dim(), self.spacing)
    }
}

pub(crate) fn physical_extent(dim: (usize, usize, usize), spacing: [f64; 3]) -> [f64; 3] {
    [
        dim.0 as f64 * spacing[0],
        dim.1 as f64 * spacing[1],
        dim.2 as f64 * spacing[2],
    ]
}
