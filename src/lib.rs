//! # Lung resampling library
//!
//! This crate turns CT scans of heterogeneous resolution into uniformly
//! spaced, intensity normalized volumes cropped to the lungs, ready for
//! nodule detection.
//!
//! Scans can be read from a directory of DICOM slices (one per patient),
//! from MetaImage (`.mhd`/`.mha`) files or from NIfTI (`.nii`/`.nii.gz`)
//! files. Every patient then goes through the same steps:
//!  - Resampling to a fixed spacing with cubic spline interpolation
//!  - Clipping to a tissue range of Hounsfield units
//!  - Slice by slice lung segmentation with a pre-trained model
//!  - Cropping to one bounding box around the lungs over the full depth
//!
//!  The cropped scan is written as `<patient>_img.npy` and its provenance
//!  (spacings, shapes, crop box, repaired metadata) is collected in
//!  `out.json`. DICOM series are assumed to have the following attributes:
//!   - Axial slices with a single frame each
//!   - One series per directory; if several acquisitions are mixed, only
//!     the most frequent one is kept
//!
//! Loading and resampling runs in parallel using rayon, segmentation runs on
//! one shared model. Enable the `onnx` feature to run exported models with
//! ONNX Runtime.
//!
//! # Examples
//!
//! ## Resampling a single scan
//!
//! ```no_run
//! # use lung_resample::{enums::StorageType, interpolator::resample_volume};
//! # use lung_resample::meta_image::MetaImageSource;
//! # use lung_resample::volume_loader::VolumeSource;
//! # use std::path::Path;
//! let raw = MetaImageSource
//!     .load(Path::new("luna16/1.3.6.1.4.1.14519.mhd"))
//!     .expect("should have loaded the scan");
//! let resampled = resample_volume(raw, [1.0, 1.0, 1.0], StorageType::Int16);
//! println!("{:?}", resampled.dim());
//! ```

pub mod bounding_box;
pub mod config;
pub mod enums;
pub mod interpolator;
pub mod meta_image;
pub mod normalize;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod scan_writer;
pub mod segmentation;
pub mod volume;
pub mod volume_loader;
