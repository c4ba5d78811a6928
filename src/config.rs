use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{enums::StorageType, normalize::TissueRange};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Spacing must be positive, got {0:?}")]
    Spacing([f64; 3]),

    #[error("Tissue range [{lo}, {hi}] is empty")]
    EmptyRange { lo: i32, hi: i32 },

    #[error("Tissue range [{lo}, {hi}] does not fit int16 storage")]
    RangeTooWide { lo: i32, hi: i32 },

    #[error("Batch size must be positive")]
    BatchSize,

    #[error("Segmentation max shape must be positive, got {0:?}")]
    MaxShape([usize; 2]),

    #[error("Checkpoint directory {0} does not exist")]
    MissingCheckpoint(PathBuf),
}

/// Parameters of a resampling run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    /// Target millimetres per voxel, (z, y, x).
    pub new_spacing_zyx: [f64; 3],
    pub hu_tissue_range: TissueRange,
    pub data_type: StorageType,
    /// Margin added around the detected lungs, (y, x).
    pub bounding_box_buffer_yx_px: [usize; 2],
    /// Largest plane the segmentation model was trained on at 1 mm, (y, x).
    pub seg_max_shape_yx: [usize; 2],
    pub batch_size: usize,
    pub checkpoint_dir: PathBuf,
    /// 0 uses one worker per core.
    pub n_workers: usize,
    /// 0 processes every discovered patient.
    pub n_patients: usize,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            new_spacing_zyx: [1.0, 1.0, 1.0],
            hu_tissue_range: TissueRange::default(),
            data_type: StorageType::Int16,
            bounding_box_buffer_yx_px: [12, 12],
            seg_max_shape_yx: [512, 512],
            batch_size: 64,
            checkpoint_dir: PathBuf::from("checkpoints/resample_lungs/lung_wings_segmentation"),
            n_workers: 0,
            n_patients: 0,
        }
    }
}

impl ResampleConfig {
    /// Read a JSON document; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.new_spacing_zyx.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(ConfigError::Spacing(self.new_spacing_zyx));
        }

        let TissueRange { lo, hi } = self.hu_tissue_range;
        if lo >= hi {
            return Err(ConfigError::EmptyRange { lo, hi });
        }
        let fits_int16 = i32::from(i16::MIN) <= lo && hi <= i32::from(i16::MAX) && hi - lo <= i32::from(i16::MAX);
        if self.data_type == StorageType::Int16 && !fits_int16 {
            return Err(ConfigError::RangeTooWide { lo, hi });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        if self.seg_max_shape_yx.contains(&0) {
            return Err(ConfigError::MaxShape(self.seg_max_shape_yx));
        }
        if !self.checkpoint_dir.is_dir() {
            return Err(ConfigError::MissingCheckpoint(self.checkpoint_dir.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid(checkpoint: &Path) -> ResampleConfig {
        ResampleConfig {
            checkpoint_dir: checkpoint.to_path_buf(),
            ..ResampleConfig::default()
        }
    }

    #[test]
    fn missing_keys_keep_defaults() {
        let config: ResampleConfig =
            serde_json::from_str(r#"{"data_type": "float32", "batch_size": 8}"#).unwrap();
        assert_eq!(config.data_type, StorageType::Float32);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.hu_tissue_range, TissueRange { lo: -1000, hi: 400 });
        assert_eq!(config.bounding_box_buffer_yx_px, [12, 12]);
        assert_eq!(config.seg_max_shape_yx, [512, 512]);
    }

    #[test]
    fn unknown_data_type_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"data_type": "float64"}"#).unwrap();
        assert!(matches!(ResampleConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn tissue_range_reads_as_a_pair() {
        let config: ResampleConfig =
            serde_json::from_str(r#"{"hu_tissue_range": [-1200, 600]}"#).unwrap();
        assert_eq!(config.hu_tissue_range, TissueRange { lo: -1200, hi: 600 });
    }

    #[test]
    fn validation_rejects_bad_values() {
        let tmp = TempDir::new().unwrap();
        assert!(valid(tmp.path()).validate().is_ok());

        let mut config = valid(tmp.path());
        config.new_spacing_zyx = [1.0, 0.0, 1.0];
        assert!(matches!(config.validate(), Err(ConfigError::Spacing(_))));

        let mut config = valid(tmp.path());
        config.hu_tissue_range = TissueRange { lo: 400, hi: -1000 };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyRange { .. })));

        let mut config = valid(tmp.path());
        config.hu_tissue_range = TissueRange { lo: -32768, hi: 32767 };
        assert!(matches!(config.validate(), Err(ConfigError::RangeTooWide { .. })));
        config.data_type = StorageType::Float32;
        assert!(config.validate().is_ok());

        let mut config = valid(tmp.path());
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::BatchSize)));

        let mut config = valid(tmp.path());
        config.seg_max_shape_yx = [512, 0];
        assert!(matches!(config.validate(), Err(ConfigError::MaxShape(_))));

        let config = valid(&tmp.path().join("missing"));
        assert!(matches!(config.validate(), Err(ConfigError::MissingCheckpoint(_))));
    }
}
