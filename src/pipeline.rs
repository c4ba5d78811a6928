//! Drives a population of patients through loading, resampling, lung
//! segmentation and cropping.
//!
//! Patients are processed in junks of one patient per worker. Loading and
//! resampling of a junk runs on the worker pool; segmentation and cropping
//! then run one patient at a time because the model is a single shared
//! resource. Metadata is flushed once per junk, after every patient in it
//! finished or failed.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::{
    bounding_box::aggregate,
    config::{ConfigError, ResampleConfig},
    enums::VolumeFormat,
    interpolator::resample_volume,
    normalize::{normalize, value_histogram},
    scan_writer::{MetadataStore, PatientRecord, ScanWriter, ScanWriterError},
    segmentation::{LungSegmenter, SegmentationError, SegmentationModel, WorkingGeometry},
    volume::ResampledVolume,
    volume_loader::{VolumeLoaderError, VolumeSource, ensure_non_empty},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No patients found in {0}")]
    NoPatients(PathBuf),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Volume loading error: {0}")]
    Loader(#[from] VolumeLoaderError),

    #[error("Segmentation error: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("Output error: {0}")]
    Writer(#[from] ScanWriterError),

    #[error("Could not start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One scan to process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patient {
    pub id: String,
    pub path: PathBuf,
}

/// List the patients below `input`, sorted by identifier. `n_patients`
/// limits the list when non-zero.
pub fn discover_patients(
    input: &Path,
    format: VolumeFormat,
    n_patients: usize,
) -> Result<Vec<Patient>, PipelineError> {
    let mut patients = Vec::new();
    for entry in fs::read_dir(input)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if hidden || !format.matches(&path) {
            continue;
        }
        if let Some(id) = format.patient_id(&path) {
            patients.push(Patient { id, path });
        }
    }

    patients.sort_by(|a, b| a.id.cmp(&b.id));
    if n_patients > 0 {
        patients.truncate(n_patients);
    }
    if patients.is_empty() {
        return Err(PipelineError::NoPatients(input.to_path_buf()));
    }
    Ok(patients)
}

#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
    pub processed: usize,
    /// (patient, reason)
    pub failed: Vec<(String, String)>,
    pub junks: usize,
}

pub struct Pipeline {
    config: ResampleConfig,
    pool: ThreadPool,
    writer: ScanWriter,
    store: MetadataStore,
}

impl Pipeline {
    pub fn new(config: ResampleConfig, out_dir: &Path) -> Result<Self, PipelineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.n_workers)
            .build()?;
        Ok(Self {
            config,
            pool,
            writer: ScanWriter::new(out_dir)?,
            store: MetadataStore::new(out_dir),
        })
    }

    /// Patients per junk.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads().max(1)
    }

    /// Process every patient. Failing patients are logged and reported in the
    /// summary; only output errors that affect the whole run are returned.
    pub fn run<M: SegmentationModel>(
        &self,
        patients: &[Patient],
        source: &dyn VolumeSource,
        segmenter: &mut LungSegmenter<M>,
    ) -> Result<RunSummary, PipelineError> {
        let workers = self.workers();
        info!(
            patients = patients.len(),
            junks = patients.len().div_ceil(workers),
            workers,
            "processing"
        );

        let mut summary = RunSummary::default();
        for (junk, chunk) in patients.chunks(workers).enumerate() {
            let started = Instant::now();
            info!(junk, patients = chunk.len(), "processing junk");

            let resampled: Vec<_> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|patient| (patient, self.load(source, patient)))
                    .collect()
            });

            let mut records = BTreeMap::new();
            for (patient, volume) in resampled {
                let result = volume.and_then(|volume| self.crop(patient, volume, segmenter));
                match result {
                    Ok(record) => {
                        records.insert(patient.id.clone(), record);
                        summary.processed += 1;
                    }
                    Err(e) => {
                        error!(patient = %patient.id, error = %e, "patient failed");
                        summary.failed.push((patient.id.clone(), e.to_string()));
                    }
                }
            }

            self.store.flush(&records, junk == 0)?;
            summary.junks += 1;
            info!(
                junk,
                processed = records.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "junk done"
            );
        }

        info!(
            processed = summary.processed,
            failed = summary.failed.len(),
            "run finished"
        );
        Ok(summary)
    }

    fn load(
        &self,
        source: &dyn VolumeSource,
        patient: &Patient,
    ) -> Result<ResampledVolume, PipelineError> {
        let started = Instant::now();
        let raw = source.load(&patient.path)?;
        let (depth, rows, cols) = raw.dim();
        ensure_non_empty(&[depth, rows, cols])?;
        let resampled = resample_volume(raw, self.config.new_spacing_zyx, self.config.data_type);
        info!(
            patient = %patient.id,
            shape = ?resampled.dim(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resampled"
        );
        Ok(resampled)
    }

    fn crop<M: SegmentationModel>(
        &self,
        patient: &Patient,
        mut volume: ResampledVolume,
        segmenter: &mut LungSegmenter<M>,
    ) -> Result<PatientRecord, PipelineError> {
        let _span = info_span!("crop", patient = %patient.id).entered();
        let range = self.config.hu_tissue_range;

        let histogram = value_histogram(&volume.data);
        volume.data = normalize(volume.data, range);

        let (_, rows, cols) = volume.dim();
        let [_, spacing_y, spacing_x] = volume.spacing;
        let image_yx = segmenter.config().image_yx();
        let label_yx = segmenter.config().label_yx();
        let geometry = WorkingGeometry::new(
            (rows, cols),
            [spacing_y, spacing_x],
            self.config.seg_max_shape_yx,
            image_yx,
        );
        if geometry.clamped {
            warn!(
                plane = ?(rows, cols),
                "scan plane exceeds the segmentation canvas, scale reduced"
            );
        }

        let masks = segmenter.segment(&volume.data, range, &geometry)?;

        // masks come at label resolution, the working crop is in image pixels
        let label_ratio = [
            label_yx.0 as f64 / image_yx.0 as f64,
            label_yx.1 as f64 / image_yx.1 as f64,
        ];
        let bounds_yx = [
            (geometry.crop_yx[0] as f64 * label_ratio[0]) as usize,
            (geometry.crop_yx[1] as f64 * label_ratio[1]) as usize,
        ];
        let [inverse_y, inverse_x] = geometry.inverse_scale_yx();
        let inverse_scale_yx = [inverse_y / label_ratio[0], inverse_x / label_ratio[1]];

        let crop = aggregate(
            &masks,
            bounds_yx,
            inverse_scale_yx,
            (rows, cols),
            self.config.bounding_box_buffer_yx_px,
        );
        let pathname = self.writer.write(&patient.id, &volume.data, &crop)?;
        Ok(PatientRecord::new(&volume, histogram, &crop, pathname))
    }
}
