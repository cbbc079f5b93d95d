use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dicom_mesh::{
    CancellationToken, DicomRecord, ExportConfig, ExportEvent, ExportRequest, SeriesGrouper,
    SortBy, StlFormat, Threshold, TissuePreset, VolumeLoader, export_to_path_async,
    validate_filename,
};
use log::{error, info, warn};
use tokio::sync::mpsc;

/// Export the largest CT series of a directory as an STL surface
#[derive(Parser)]
#[command(name = "dicom-mesh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding the DICOM files
    input: PathBuf,

    /// Directory the STL file is written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Output name without extension (defaults to the input directory name)
    #[arg(short, long)]
    name: Option<String>,

    /// Isosurface threshold in Hounsfield Units
    #[arg(long, conflicts_with = "preset")]
    threshold: Option<f64>,

    /// Tissue preset: bone, muscle or skin
    #[arg(long)]
    preset: Option<TissuePreset>,

    /// Smooth the surface before writing
    #[arg(long)]
    smooth: bool,

    /// Write ASCII instead of binary STL
    #[arg(long)]
    ascii: bool,

    /// JSON file with export settings
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn threshold(&self) -> Threshold {
        match (self.threshold, self.preset) {
            (Some(value), _) => Threshold::Custom(value),
            (None, Some(preset)) => Threshold::Preset(preset),
            (None, None) => Threshold::default(),
        }
    }

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.input
                .canonicalize()
                .ok()
                .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "mesh".to_string())
        })
    }

    fn export_config(&self) -> Result<ExportConfig> {
        let config = match &self.config {
            Some(path) => ExportConfig::from_json_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => ExportConfig::default(),
        };
        Ok(if self.ascii {
            config.with_format(StlFormat::Ascii)
        } else {
            config
        })
    }
}

fn log_event(event: &ExportEvent) {
    match event {
        ExportEvent::Progress { stage, metrics } => info!("{stage}: {metrics}"),
        ExportEvent::Failed { stage, reason } => error!("{stage} failed: {reason}"),
        ExportEvent::Cancelled { stage } => warn!("cancelled before {stage}"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();

    let cli = Cli::parse();
    let config = cli.export_config()?;
    let name = cli.name();
    validate_filename(&name).with_context(|| format!("output name {name:?}"))?;

    let records = DicomRecord::scan_directory(&cli.input)
        .with_context(|| format!("scanning {}", cli.input.display()))?;
    let groups = SeriesGrouper::group(records);
    info!(
        "found {} series with {} DICOM files",
        groups.series_count(),
        groups.record_count()
    );
    let (patient, study, series, records) = groups
        .largest_series()
        .context("no DICOM series found")?;
    info!(
        "using series {series} of study {study} (patient {patient}), {} files",
        records.len()
    );

    let volume = VolumeLoader::load_series(records, SortBy::ImagePositionPatient)
        .context("loading volume")?;
    let (nx, ny, nz) = volume.dimensions();
    info!("volume {nx}x{ny}x{nz}, spacing {:?}", volume.spacing());

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating {}", cli.output.display()))?;

    let request = ExportRequest::new(name, cli.threshold()).with_smoothing(cli.smooth);
    let (events, mut received) = mpsc::unbounded_channel();
    let export = export_to_path_async(
        Arc::new(volume),
        request,
        config,
        cli.output.clone(),
        CancellationToken::new(),
        Some(events),
    );
    let progress = async {
        while let Some(event) = received.recv().await {
            log_event(&event);
        }
    };
    let (written, ()) = tokio::join!(export, progress);
    let (path, metrics) = written.context("exporting mesh")?;
    info!("wrote {}: {metrics}", path.display());
    Ok(())
}
