//! ONNX Runtime backend for the lung segmentation model.

use std::path::Path;

use ndarray::ArrayView3;
use ort::session::{Session, builder::GraphOptimizationLevel};
use tracing::info;

use crate::segmentation::{SegmentationError, SegmentationModel};

/// Name of the exported network inside a checkpoint directory.
pub const MODEL_FILE: &str = "model.onnx";

fn inference_error(err: ort::Error) -> SegmentationError {
    SegmentationError::Inference(err.to_string())
}

/// A segmentation network taking NHWC input, `(batch, rows, cols, 1)`.
pub struct OnnxModel {
    session: Session,
    input_name: String,
}

impl OnnxModel {
    pub fn open(checkpoint_dir: &Path) -> Result<Self, SegmentationError> {
        let path = checkpoint_dir.join(MODEL_FILE);
        info!(model = %path.display(), "loading segmentation model");

        let session = Session::builder()
            .map_err(inference_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(inference_error)?
            .commit_from_file(&path)
            .map_err(inference_error)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| SegmentationError::Config(format!("{} has no inputs", path.display())))?;

        Ok(Self {
            session,
            input_name,
        })
    }
}

impl SegmentationModel for OnnxModel {
    fn infer(&mut self, batch: ArrayView3<'_, f32>) -> Result<Vec<f32>, SegmentationError> {
        let (n, rows, cols) = batch.dim();
        let shape = [n, rows, cols, 1];
        let data: Vec<f32> = batch.iter().copied().collect();
        let input = ort::value::Value::from_array((shape.as_slice(), data.into_boxed_slice()))
            .map_err(inference_error)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(inference_error)?;
        let (_, probabilities) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(inference_error)?;
        Ok(probabilities.to_vec())
    }
}
