//! Slice-by-slice lung segmentation with a pre-trained binary model.
//!
//! The model is a black box consuming `(batch, rows, cols)` slices in
//! `[-1, 1]` and producing one lung probability per pixel of its label
//! shape. Everything model specific about the input (8-bit conversion,
//! letterboxing into the model resolution, value remapping) happens here.

use std::{fs, path::Path};

use fast_image_resize as fir;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    enums::StorageType,
    normalize::{PIXEL_MEAN, TissueRange},
    volume::VoxelArray,
};

/// Name of the model description inside a checkpoint directory.
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Batch slots past the end of the volume are filled with this value, which
/// is also what an all-black slice maps to.
pub const PAD_VALUE: f32 = -1.0;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Invalid model configuration: {0}")]
    Config(String),

    #[error("Segmentation model unavailable: {0}")]
    Unavailable(String),

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Model returned {found} values for a batch, expected {expected}")]
    OutputSize { expected: usize, found: usize },

    #[error("Slice resize failed: {0}")]
    Resize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// The part of a checkpoint's `config.json` this crate relies on.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    /// (rows, cols, ..) of the model input.
    pub image_shape: Vec<usize>,
    /// (rows, cols, ..) of the model output.
    pub label_shape: Vec<usize>,
}

impl ModelConfig {
    pub fn new(image_yx: (usize, usize), label_yx: (usize, usize)) -> Self {
        Self {
            image_shape: vec![image_yx.0, image_yx.1, 1],
            label_shape: vec![label_yx.0, label_yx.1, 1],
        }
    }

    pub fn load(checkpoint_dir: &Path) -> Result<Self, SegmentationError> {
        let text = fs::read_to_string(checkpoint_dir.join(MODEL_CONFIG_FILE))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SegmentationError> {
        for (name, shape) in [("image_shape", &self.image_shape), ("label_shape", &self.label_shape)] {
            if shape.len() < 2 || shape[0] == 0 || shape[1] == 0 {
                return Err(SegmentationError::Config(format!(
                    "{name} must start with two positive dimensions, got {shape:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn image_yx(&self) -> (usize, usize) {
        (self.image_shape[0], self.image_shape[1])
    }

    pub fn label_yx(&self) -> (usize, usize) {
        (self.label_shape[0], self.label_shape[1])
    }
}

/// A loaded segmentation network.
pub trait SegmentationModel {
    /// Lung probabilities for `batch` (batch, rows, cols) with values in
    /// `[-1, 1]`, flattened batch-major over the label shape.
    fn infer(&mut self, batch: ArrayView3<'_, f32>) -> Result<Vec<f32>, SegmentationError>;

    /// Release whatever the model holds on to.
    fn close(&mut self) {}
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    fn infer(&mut self, batch: ArrayView3<'_, f32>) -> Result<Vec<f32>, SegmentationError> {
        (**self).infer(batch)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Open the model stored in `checkpoint_dir`.
#[cfg(feature = "onnx")]
pub fn open_model(checkpoint_dir: &Path) -> Result<Box<dyn SegmentationModel>, SegmentationError> {
    Ok(Box::new(crate::onnx::OnnxModel::open(checkpoint_dir)?))
}

/// Open the model stored in `checkpoint_dir`.
#[cfg(not(feature = "onnx"))]
pub fn open_model(checkpoint_dir: &Path) -> Result<Box<dyn SegmentationModel>, SegmentationError> {
    Err(SegmentationError::Unavailable(format!(
        "{} needs an inference backend, rebuild with `--features onnx`",
        checkpoint_dir.display()
    )))
}

/// Mapping between the resampled slice plane and the model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkingGeometry {
    /// Model pixels per resampled pixel, (y, x).
    pub scale_yx: [f64; 2],
    /// Size of the resized slice inside the model canvas, (rows, cols).
    pub crop_yx: [usize; 2],
    /// Whether the scale had to be reduced for the slice to fit the canvas.
    pub clamped: bool,
}

impl WorkingGeometry {
    /// `seg_max_shape_yx` is the largest plane (in millimetres at 1 mm
    /// spacing) the model was trained on; it is scaled to the resampled
    /// spacing so lungs keep their physical proportions in the canvas.
    pub fn new(
        native_yx: (usize, usize),
        spacing_yx: [f64; 2],
        seg_max_shape_yx: [usize; 2],
        image_yx: (usize, usize),
    ) -> Self {
        let max_y = ((seg_max_shape_yx[0] as f64 / spacing_yx[0]) as usize).max(1);
        let max_x = ((seg_max_shape_yx[1] as f64 / spacing_yx[1]) as usize).max(1);
        let mut scale_yx = [
            image_yx.0 as f64 / max_y as f64,
            image_yx.1 as f64 / max_x as f64,
        ];

        let fit = [
            image_yx.0 as f64 / native_yx.0.max(1) as f64,
            image_yx.1 as f64 / native_yx.1.max(1) as f64,
        ];
        let clamped = scale_yx[0] > fit[0] || scale_yx[1] > fit[1];
        if clamped {
            scale_yx = [scale_yx[0].min(fit[0]), scale_yx[1].min(fit[1])];
        }

        let crop_yx = [
            ((native_yx.0 as f64 * scale_yx[0]) as usize).clamp(1, image_yx.0),
            ((native_yx.1 as f64 * scale_yx[1]) as usize).clamp(1, image_yx.1),
        ];

        Self {
            scale_yx,
            crop_yx,
            clamped,
        }
    }

    pub fn inverse_scale_yx(&self) -> [f64; 2] {
        [1.0 / self.scale_yx[0], 1.0 / self.scale_yx[1]]
    }
}

/// 8-bit rendering of a normalized slice. Float scans are in
/// `[-0.25, 0.75]`, integer scans in `[0, hi - lo]`.
pub fn slice_to_u8(slice: ArrayView2<'_, f32>, storage: StorageType, range: TissueRange) -> Array2<u8> {
    match storage {
        StorageType::Float32 => slice.mapv(|v| ((v + PIXEL_MEAN) * 255.0) as u8),
        StorageType::Int16 => {
            let width = range.width() as f32;
            slice.mapv(|v| ((v / width) * 255.0) as u8)
        }
    }
}

/// Area-averaging resize of an 8-bit slice to (rows, cols).
pub fn resize_area(
    slice: &Array2<u8>,
    rows: usize,
    cols: usize,
) -> Result<Array2<u8>, SegmentationError> {
    let (height, width) = slice.dim();
    if (height, width) == (rows, cols) {
        return Ok(slice.clone());
    }

    let src = fir::images::Image::from_vec_u8(
        width as u32,
        height as u32,
        slice.iter().copied().collect(),
        fir::pixels::PixelType::U8,
    )
    .map_err(|e| SegmentationError::Resize(e.to_string()))?;
    let mut dst = fir::images::Image::new(cols as u32, rows as u32, fir::pixels::PixelType::U8);
    let options =
        fir::ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Box));
    fir::Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| SegmentationError::Resize(e.to_string()))?;

    Ok(Array2::from_shape_vec((rows, cols), dst.into_vec())?)
}

/// The shared segmentation engine. Opened once per run, used sequentially,
/// and released exactly once, either by [`LungSegmenter::close`] or on drop.
pub struct LungSegmenter<M: SegmentationModel> {
    model: M,
    config: ModelConfig,
    batch_size: usize,
    released: bool,
}

impl<M: SegmentationModel> LungSegmenter<M> {
    pub fn open(model: M, config: ModelConfig, batch_size: usize) -> Self {
        info!(
            image_shape = ?config.image_yx(),
            label_shape = ?config.label_yx(),
            batch_size,
            "segmentation model opened"
        );
        Self {
            model,
            config,
            batch_size: batch_size.max(1),
            released: false,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Per-slice 8-bit lung masks at the model's label resolution, one per
    /// axial slice of `volume`.
    pub fn segment(
        &mut self,
        volume: &VoxelArray,
        range: TissueRange,
        geometry: &WorkingGeometry,
    ) -> Result<Vec<Array2<u8>>, SegmentationError> {
        let (depth, _, _) = volume.dim();
        let storage = volume.storage_type();
        let (rows, cols) = self.config.image_yx();
        let (label_rows, label_cols) = self.config.label_yx();
        let [crop_y, crop_x] = geometry.crop_yx;

        if let VoxelArray::Float32(data) = volume {
            let overflow = data.iter().filter(|&&v| (v + PIXEL_MEAN) * 255.0 >= 256.0).count();
            if overflow > 0 {
                error!(overflow, "normalized values exceed the 8-bit range");
            }
        }

        let mut masks = Vec::with_capacity(depth);
        for start in (0..depth).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(depth);
            let mut batch = Array3::<f32>::from_elem((self.batch_size, rows, cols), PAD_VALUE);

            for (slot, z) in (start..end).enumerate() {
                let pixels = slice_to_u8(volume.slice_f32(z).view(), storage, range);
                let resized = resize_area(&pixels, crop_y, crop_x)?;
                batch
                    .index_axis_mut(Axis(0), slot)
                    .slice_mut(s![..crop_y, ..crop_x])
                    .zip_mut_with(&resized, |out, &v| *out = (f32::from(v) - 128.0) / 128.0);
            }

            let probabilities = self.model.infer(batch.view())?;
            let expected = self.batch_size * label_rows * label_cols;
            if probabilities.len() != expected {
                return Err(SegmentationError::OutputSize {
                    expected,
                    found: probabilities.len(),
                });
            }
            let probabilities =
                Array3::from_shape_vec((self.batch_size, label_rows, label_cols), probabilities)?;

            // padded slots are dropped here
            for slot in 0..end - start {
                masks.push(
                    probabilities
                        .index_axis(Axis(0), slot)
                        .mapv(|p| (p * 255.0) as u8),
                );
            }
            debug!(start, end, "segmented batch");
        }
        Ok(masks)
    }

    /// Release the model now instead of on drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.model.close();
            self.released = true;
            info!("segmentation model released");
        }
    }
}

impl<M: SegmentationModel> Drop for LungSegmenter<M> {
    fn drop(&mut self) {
        self.release();
    }
}
