//! Cropped scan persistence and the per-population metadata document.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use ndarray::{Array3, s};
use ndarray_npy::{WriteNpyError, write_npy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    bounding_box::CropBox,
    normalize::ValueHistogram,
    volume::{AcquisitionException, ResampledVolume, VoxelArray},
};

/// Name of the metadata document inside the output directory.
pub const METADATA_FILE: &str = "out.json";

#[derive(Debug, Error)]
pub enum ScanWriterError {
    #[error("Crop {crop:?} exceeds the scan plane {plane:?}")]
    InvalidCrop {
        crop: [usize; 4],
        plane: (usize, usize),
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NPY error: {0}")]
    Npy(#[from] WriteNpyError),
}

/// Provenance of one processed patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub resampled_scan_spacing_zyx_mm: [f64; 3],
    pub resampled_scan_shape_zyx_px: [usize; 3],
    pub raw_scan_spacing_zyx_mm: [f64; 3],
    pub raw_scan_shape_zyx_px: [usize; 3],
    pub raw_scan_origin_zyx_mm: Option<[f64; 3]>,
    pub acquisition_exception: Option<AcquisitionException>,
    pub pre_normalized_value_histogram: Vec<f64>,
    pub pre_normalized_value_range: Vec<f64>,
    pub bound_box_coords_yx_px: [usize; 4],
    pub bound_box_shape_yx_px: [usize; 2],
    pub basename: String,
    pub pathname: PathBuf,
}

impl PatientRecord {
    pub fn new(
        volume: &ResampledVolume,
        histogram: ValueHistogram,
        crop: &CropBox,
        pathname: PathBuf,
    ) -> Self {
        let (z, y, x) = volume.dim();
        let (rz, ry, rx) = volume.raw_shape;
        let (rows, cols) = crop.shape();
        let basename = pathname
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            resampled_scan_spacing_zyx_mm: volume.spacing,
            resampled_scan_shape_zyx_px: [z, y, x],
            raw_scan_spacing_zyx_mm: volume.raw_spacing,
            raw_scan_shape_zyx_px: [rz, ry, rx],
            raw_scan_origin_zyx_mm: volume.raw_origin,
            acquisition_exception: volume.acquisition_exception.clone(),
            pre_normalized_value_histogram: histogram.density,
            pre_normalized_value_range: histogram.bin_edges,
            bound_box_coords_yx_px: crop.coords(),
            bound_box_shape_yx_px: [rows, cols],
            basename,
            pathname,
        }
    }
}

/// Writes cropped scans as `<patient>_img.npy` into one directory.
pub struct ScanWriter {
    out_dir: PathBuf,
}

impl ScanWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Result<Self, ScanWriterError> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        Ok(Self { out_dir })
    }

    pub fn basename(patient: &str) -> String {
        format!("{patient}_img.npy")
    }

    /// Crop `voxels` in-plane over the full depth and write them.
    pub fn write(
        &self,
        patient: &str,
        voxels: &VoxelArray,
        crop: &CropBox,
    ) -> Result<PathBuf, ScanWriterError> {
        let (_, rows, cols) = voxels.dim();
        if crop.y_min > crop.y_max || crop.x_min > crop.x_max || crop.y_max > rows || crop.x_max > cols {
            return Err(ScanWriterError::InvalidCrop {
                crop: crop.coords(),
                plane: (rows, cols),
            });
        }

        let path = self.out_dir.join(Self::basename(patient));
        match voxels {
            VoxelArray::Int16(data) => write_cropped(&path, data, crop)?,
            VoxelArray::Float32(data) => write_cropped(&path, data, crop)?,
        }
        debug!(patient, path = %path.display(), crop = ?crop.coords(), "wrote scan");
        Ok(path)
    }
}

fn write_cropped<A>(path: &Path, data: &Array3<A>, crop: &CropBox) -> Result<(), WriteNpyError>
where
    A: ndarray_npy::WritableElement + Clone,
{
    let view = data.slice(s![.., crop.y_min..crop.y_max, crop.x_min..crop.x_max]);
    write_npy(path, &view.as_standard_layout())
}

/// `out.json`, mapping patient id to [`PatientRecord`]. Each flush replaces
/// the file atomically, so a crash never leaves a half-written document.
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            path: out_dir.join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `records`. The first flush of a run starts a fresh document;
    /// later flushes merge into what earlier junks wrote.
    pub fn flush(
        &self,
        records: &BTreeMap<String, PatientRecord>,
        fresh: bool,
    ) -> Result<(), ScanWriterError> {
        let mut document = if fresh || !self.path.exists() {
            BTreeMap::new()
        } else {
            self.load_raw()?
        };
        for (patient, record) in records {
            document.insert(patient.clone(), serde_json::to_value(record)?);
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &document)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), patients = document.len(), "flushed metadata");
        Ok(())
    }

    /// Read the document back.
    pub fn load(&self) -> Result<BTreeMap<String, PatientRecord>, ScanWriterError> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn load_raw(&self) -> Result<BTreeMap<String, serde_json::Value>, ScanWriterError> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
