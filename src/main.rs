use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lung_resample::{
    config::ResampleConfig,
    enums::{StorageType, VolumeFormat},
    pipeline::{Pipeline, discover_patients},
    segmentation::{LungSegmenter, ModelConfig, open_model},
    volume_loader::source_for,
};

#[derive(Debug, Parser)]
#[command(
    name = "lung-resample",
    version,
    about = "Resample CT scans to a uniform spacing and crop them to the lungs"
)]
struct Cli {
    #[arg(long, help = "Directory with one DICOM series directory or volume file per patient")]
    input: PathBuf,

    #[arg(long, help = "Directory receiving <patient>_img.npy and out.json")]
    output: PathBuf,

    #[arg(long, help = "Input format: dicom|meta-image|nifti (detected when omitted)")]
    format: Option<VolumeFormat>,

    #[arg(long, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, help = "Output storage: int16|float32")]
    data_type: Option<StorageType>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long, help = "Number of worker threads (0 = auto)")]
    workers: Option<usize>,

    #[arg(long, help = "Process only the first N patients (0 = all)")]
    patients: Option<usize>,
}

fn detect_format(input: &std::path::Path) -> Result<VolumeFormat> {
    let mut entries = fs::read_dir(input)
        .with_context(|| format!("reading {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();
    entries
        .iter()
        .find_map(|path| VolumeFormat::detect(path))
        .with_context(|| format!("no scans recognized in {}", input.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ResampleConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => ResampleConfig::default(),
    };
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint_dir = dir;
    }
    if let Some(data_type) = cli.data_type {
        config.data_type = data_type;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = cli.workers {
        config.n_workers = workers;
    }
    if let Some(patients) = cli.patients {
        config.n_patients = patients;
    }
    config.validate().context("invalid configuration")?;

    let format = match cli.format {
        Some(format) => format,
        None => detect_format(&cli.input)?,
    };
    let patients = discover_patients(&cli.input, format, config.n_patients)?;
    tracing::info!(
        format = ?format,
        patients = patients.len(),
        data_type = %config.data_type,
        "starting run"
    );

    let model_config = ModelConfig::load(&config.checkpoint_dir)
        .with_context(|| format!("loading model config from {}", config.checkpoint_dir.display()))?;
    let model = open_model(&config.checkpoint_dir)?;
    let mut segmenter = LungSegmenter::open(model, model_config, config.batch_size);

    let source = source_for(format);
    let pipeline = Pipeline::new(config, &cli.output)?;
    let summary = pipeline.run(&patients, source.as_ref(), &mut segmenter)?;
    segmenter.close();

    for (patient, reason) in &summary.failed {
        tracing::warn!(patient = %patient, reason = %reason, "not processed");
    }
    if summary.processed == 0 {
        anyhow::bail!("no patient could be processed");
    }
    Ok(())
}
