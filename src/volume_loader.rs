use crate::{
    enums::VolumeFormat,
    meta_image::MetaImageSource,
    volume::{AcquisitionException, RawVolume},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, ArrayD, Axis, Ix3, s};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use rayon::prelude::*;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

/// Physically plausible in-plane pixel spacing, in millimetres.
pub const PLAUSIBLE_PIXEL_SPACING: (f64, f64) = (0.1, 5.0);

/// Pixel spacings are binned to micrometres before taking the mode.
const SPACING_BINS_PER_MM: f64 = 1000.0;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("At least two slices are needed to derive the slice thickness, found {0}")]
    TooFewSlices(usize),

    #[error("Invalid slice thickness {0} mm")]
    InvalidSliceThickness(f64),

    #[error("Volume has an empty axis, shape {0:?}")]
    EmptyAxis(Vec<usize>),

    #[error("Unsupported volume: {0}")]
    Unsupported(String),

    #[error("Malformed MetaImage header: {0}")]
    MetaImageHeader(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("DICOM pixel data error: {0}")]
    PixelData(#[from] dicom::pixeldata::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Something that can turn one patient's raw data into a [`RawVolume`].
pub trait VolumeSource: Send + Sync {
    /// Load the scan of one patient
    ///
    /// # Arguments
    ///
    /// * `path` - Series directory or volume file of the patient
    ///
    /// # Errors
    ///
    /// Returns error if the data cannot be read or decoded, if an axis is
    /// empty, or if the spacing cannot be determined
    fn load(&self, path: &Path) -> Result<RawVolume, VolumeLoaderError>;
}

/// Reject shapes with a zero-length axis.
pub(crate) fn ensure_non_empty(shape: &[usize]) -> Result<(), VolumeLoaderError> {
    if shape.contains(&0) {
        return Err(VolumeLoaderError::EmptyAxis(shape.to_vec()));
    }
    Ok(())
}

/// Loader for the given on-disk format.
pub fn source_for(format: VolumeFormat) -> Box<dyn VolumeSource> {
    match format {
        VolumeFormat::DicomSeries => Box::new(DicomSeriesSource),
        VolumeFormat::MetaImage => Box::new(MetaImageSource),
        VolumeFormat::Nifti => Box::new(NiftiSource),
    }
}

/// Header fields and stored pixel values of one DICOM slice.
#[derive(Clone, Debug)]
pub struct SliceRecord {
    pub acquisition_number: Option<i64>,
    /// Third component of ImagePositionPatient.
    pub position_z: Option<f64>,
    pub slice_location: Option<f64>,
    /// (row, column) spacing as stored, `None` when absent or non-numeric.
    pub pixel_spacing: [Option<f64>; 2],
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    pub pixels: Array2<i32>,
}

impl SliceRecord {
    pub fn from_header(dicom_object: &InMemDicomObject, pixels: Array2<i32>) -> Self {
        let acquisition_number = read_str(dicom_object, tags::ACQUISITION_NUMBER)
            .and_then(|s| s.trim().parse::<i64>().ok());
        let position_z = read_multi(dicom_object, tags::IMAGE_POSITION_PATIENT)
            .and_then(|values| values.get(2).copied().flatten());
        let slice_location = read_multi(dicom_object, tags::SLICE_LOCATION)
            .and_then(|values| values.first().copied().flatten());
        let spacing = read_multi(dicom_object, tags::PIXEL_SPACING).unwrap_or_default();
        let rescale_slope = read_multi(dicom_object, tags::RESCALE_SLOPE)
            .and_then(|values| values.first().copied().flatten())
            .unwrap_or(1.0);
        let rescale_intercept = read_multi(dicom_object, tags::RESCALE_INTERCEPT)
            .and_then(|values| values.first().copied().flatten())
            .unwrap_or(0.0);

        Self {
            acquisition_number,
            position_z,
            slice_location,
            pixel_spacing: [
                spacing.first().copied().flatten(),
                spacing.get(1).copied().flatten(),
            ],
            rescale_slope,
            rescale_intercept,
            pixels,
        }
    }

    fn depth(&self) -> Option<f64> {
        self.position_z.or(self.slice_location)
    }
}

fn read_str(dicom_object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    dicom_object
        .element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|s| s.into_owned())
}

/// Backslash separated numeric values; entries that do not parse become `None`.
fn read_multi(dicom_object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<Vec<Option<f64>>> {
    let raw = read_str(dicom_object, tag)?;
    Some(
        raw.split('\\')
            .map(|part| part.trim().trim_end_matches('\0').parse::<f64>().ok())
            .collect(),
    )
}

/// A directory holding the 2-D slices of one scan.
pub struct DicomSeriesSource;

impl VolumeSource for DicomSeriesSource {
    fn load(&self, path: &Path) -> Result<RawVolume, VolumeLoaderError> {
        let paths = Self::slice_paths(path)?;
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        let slices = paths
            .par_iter()
            .map(|path| Self::read_slice(path))
            .collect::<Result<Vec<_>, _>>()?;

        assemble_series(slices, &path.display().to_string())
    }
}

impl DicomSeriesSource {
    fn slice_paths(path: &Path) -> Result<Vec<PathBuf>, VolumeLoaderError> {
        let mut paths: Vec<_> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                let hidden = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                let extension = path.extension().and_then(|s| s.to_str());
                !hidden && extension.is_none_or(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_slice(path: &Path) -> Result<SliceRecord, VolumeLoaderError> {
        let dicom_object = open_file(path)?;
        let pixels = Self::decode_image(&dicom_object)?;
        Ok(SliceRecord::from_header(&dicom_object, pixels))
    }

    /// Stored pixel values of the first frame, without the modality LUT.
    fn decode_image(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Result<Array2<i32>, VolumeLoaderError> {
        let pixel_data = dicom_object.decode_pixel_data()?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
        let array = pixel_data.to_ndarray_with_options::<i32>(&options)?;
        Ok(array.slice_move(s![0, .., .., 0]))
    }
}

/// Turn the decoded slices of one series into a volume, repairing the
/// metadata the way it is usually broken in the wild
///
/// # Arguments
///
/// * `slices` - Decoded slices in any order, possibly from several acquisitions
/// * `patient` - Identifier used in log messages
///
/// # Errors
///
/// Returns error if no slices are given, fewer than two remain after the
/// acquisition is selected, slice dimensions differ or are empty, or no
/// plausible pixel spacing is found
pub fn assemble_series(
    slices: Vec<SliceRecord>,
    patient: &str,
) -> Result<RawVolume, VolumeLoaderError> {
    if slices.is_empty() {
        return Err(VolumeLoaderError::NoValidImages);
    }

    let (mut slices, acquisition_exception) = select_acquisition(slices, patient);
    slices.sort_by(|a, b| a.depth().partial_cmp(&b.depth()).unwrap_or(Ordering::Equal));

    let slice_thickness = slice_thickness(&slices)?;
    let pixel_spacing = repair_pixel_spacing(&mut slices, patient)?;
    let data = pixels_to_hu(&slices, patient)?;

    Ok(RawVolume {
        data,
        spacing: [slice_thickness, pixel_spacing[0], pixel_spacing[1]],
        origin: None,
        acquisition_exception,
    })
}

/// Keep the acquisition with the most slices. Ties go to the larger
/// acquisition number.
///
/// # Arguments
///
/// * `slices` - All slices of the series
/// * `patient` - Identifier used in log messages
pub fn select_acquisition(
    slices: Vec<SliceRecord>,
    patient: &str,
) -> (Vec<SliceRecord>, Option<AcquisitionException>) {
    let mut counts: BTreeMap<Option<i64>, usize> = BTreeMap::new();
    for slice in &slices {
        *counts.entry(slice.acquisition_number).or_default() += 1;
    }

    if counts.len() == 1 {
        if counts.contains_key(&None) {
            warn!(patient, "series without acquisition number");
            return (slices, Some(AcquisitionException::MissingAcquisitionNumber));
        }
        return (slices, None);
    }

    // BTreeMap iterates in ascending key order, so `>=` keeps the last of
    // equally frequent acquisitions.
    let mut selected = None;
    let mut best = 0;
    for (&number, &count) in &counts {
        if count >= best {
            best = count;
            selected = number;
        }
    }

    let acquisition_numbers: Vec<String> = counts.keys().map(|&n| label(n)).collect();
    let count_list: Vec<usize> = counts.values().copied().collect();
    warn!(
        patient,
        acquisitions = ?acquisition_numbers,
        counts = ?count_list,
        selected = %label(selected),
        "multiple acquisitions in series, keeping the most frequent"
    );

    let kept = slices
        .into_iter()
        .filter(|slice| slice.acquisition_number == selected)
        .collect();
    let exception = AcquisitionException::MultipleAcquisitions {
        acquisition_numbers,
        counts: count_list,
        selected: label(selected),
    };
    (kept, Some(exception))
}

fn label(acquisition_number: Option<i64>) -> String {
    acquisition_number.map_or_else(|| "none".to_string(), |n| n.to_string())
}

/// Distance between the first two slices, from ImagePositionPatient or,
/// failing that, SliceLocation. Slices must already be sorted.
pub fn slice_thickness(slices: &[SliceRecord]) -> Result<f64, VolumeLoaderError> {
    if slices.len() < 2 {
        return Err(VolumeLoaderError::TooFewSlices(slices.len()));
    }
    let (first, second) = (&slices[0], &slices[1]);
    let thickness = match (first.position_z, second.position_z) {
        (Some(a), Some(b)) => (a - b).abs(),
        _ => match (first.slice_location, second.slice_location) {
            (Some(a), Some(b)) => (a - b).abs(),
            _ => return Err(VolumeLoaderError::MissingSpacing),
        },
    };
    if !thickness.is_finite() || thickness <= 0.0 {
        return Err(VolumeLoaderError::InvalidSliceThickness(thickness));
    }
    Ok(thickness)
}

pub fn is_plausible_spacing(value: Option<f64>) -> bool {
    value.is_some_and(|v| {
        v.is_finite() && (PLAUSIBLE_PIXEL_SPACING.0..=PLAUSIBLE_PIXEL_SPACING.1).contains(&v)
    })
}

/// Most frequent value after binning to micrometres; ties go to the smaller
/// spacing.
pub fn spacing_mode(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut bins: BTreeMap<i64, usize> = BTreeMap::new();
    for value in values {
        *bins.entry((value * SPACING_BINS_PER_MM).round() as i64).or_default() += 1;
    }
    let mut mode = None;
    let mut best = 0;
    for (&bin, &count) in &bins {
        if count > best {
            best = count;
            mode = Some(bin);
        }
    }
    mode.map(|bin| bin as f64 / SPACING_BINS_PER_MM)
}

/// Replace missing or implausible pixel spacings by the series mode of that
/// axis. Returns the (row, column) spacing of the first slice.
pub fn repair_pixel_spacing(
    slices: &mut [SliceRecord],
    patient: &str,
) -> Result<[f64; 2], VolumeLoaderError> {
    for axis in 0..2 {
        let invalid = slices
            .iter()
            .filter(|slice| !is_plausible_spacing(slice.pixel_spacing[axis]))
            .count();
        if invalid == 0 {
            continue;
        }

        let mode = spacing_mode(
            slices
                .iter()
                .filter_map(|slice| slice.pixel_spacing[axis])
                .filter(|&v| is_plausible_spacing(Some(v))),
        )
        .ok_or(VolumeLoaderError::MissingSpacing)?;
        warn!(
            patient,
            axis,
            invalid,
            replacement = mode,
            "implausible pixel spacing replaced by the series mode"
        );

        for slice in slices.iter_mut() {
            if !is_plausible_spacing(slice.pixel_spacing[axis]) {
                slice.pixel_spacing[axis] = Some(mode);
            }
        }
    }

    let first = slices.first().ok_or(VolumeLoaderError::NoValidImages)?;
    match first.pixel_spacing {
        [Some(row), Some(col)] => Ok([row, col]),
        _ => Err(VolumeLoaderError::MissingSpacing),
    }
}

/// Stack the slices and apply each slice's rescale slope and intercept.
pub fn pixels_to_hu(slices: &[SliceRecord], patient: &str) -> Result<Array3<i16>, VolumeLoaderError> {
    let first = slices.first().ok_or(VolumeLoaderError::NoValidImages)?;
    let (height, width) = first.pixels.dim();
    if slices.iter().any(|slice| slice.pixels.dim() != (height, width)) {
        return Err(VolumeLoaderError::InconsistentDimensions);
    }
    ensure_non_empty(&[slices.len(), height, width])?;

    let stored = slices.iter().flat_map(|slice| slice.pixels.iter().copied());
    let (min_stored, max_stored) = stored.fold((i32::MAX, i32::MIN), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if min_stored < i32::from(i16::MIN) || max_stored > i32::from(i16::MAX) {
        error!(
            patient,
            min_stored,
            max_stored,
            "stored pixel values exceed the int16 range, clamping"
        );
    }

    let mut volume = Array3::<i16>::zeros((slices.len(), height, width));
    for (mut layer, slice) in volume.axis_iter_mut(Axis(0)).zip(slices) {
        let intercept = slice.rescale_intercept as i16;
        let slope = slice.rescale_slope;
        layer.zip_mut_with(&slice.pixels, |out, &stored| {
            let stored = stored.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            let scaled = if slope != 1.0 {
                (slope * f64::from(stored)) as i16
            } else {
                stored
            };
            *out = scaled.saturating_add(intercept);
        });
    }
    Ok(volume)
}

/// Saturating conversion of a floating point HU volume, logging values that
/// do not fit.
pub(crate) fn hu_from_f32(data: Array3<f32>, source: &Path) -> Array3<i16> {
    let out_of_range = data
        .iter()
        .filter(|&&v| v > f32::from(i16::MAX) || v < f32::from(i16::MIN))
        .count();
    if out_of_range > 0 {
        error!(
            source = %source.display(),
            out_of_range, "voxel values exceed the int16 range, clamping"
        );
    }
    data.mapv(|v| v.round() as i16)
}

/// A single NIfTI-1 file (`.nii` or `.nii.gz`).
pub struct NiftiSource;

impl VolumeSource for NiftiSource {
    fn load(&self, path: &Path) -> Result<RawVolume, VolumeLoaderError> {
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();

        let data: ArrayD<f32> = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data,
            4 if data.shape()[3] == 1 => data.index_axis_move(Axis(3), 0),
            _ => {
                return Err(VolumeLoaderError::Unsupported(format!(
                    "expected a 3-D NIfTI volume, found shape {:?}",
                    data.shape()
                )));
            }
        };

        ensure_non_empty(data.shape())?;

        // [x, y, z] -> [z, y, x]
        let data = data
            .permuted_axes([2, 1, 0].as_slice())
            .into_dimensionality::<Ix3>()?
            .as_standard_layout()
            .into_owned();

        let pixdim = header.pixdim;
        let spacing = [
            f64::from(pixdim[3]).abs(),
            f64::from(pixdim[2]).abs(),
            f64::from(pixdim[1]).abs(),
        ];
        if spacing.iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(VolumeLoaderError::MissingSpacing);
        }
        let origin = [
            f64::from(header.quatern_z),
            f64::from(header.quatern_y),
            f64::from(header.quatern_x),
        ];

        Ok(RawVolume {
            data: hu_from_f32(data, path),
            spacing,
            origin: Some(origin),
            acquisition_exception: None,
        })
    }
}
