//! The export state machine: extract, optionally smooth, then serialize.
//!
//! ```text
//! Idle -> Extracting -> [Smoothing] -> Writing -> Complete
//!              \              \            \
//!               +--------------+------------+--> Error | Cancelled
//! ```
//!
//! Observers receive a [`ExportEvent::Progress`] snapshot when each stage
//! finishes, then a final `Complete` event once the output exists.
//! Cancellation is checked between stages only.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use log::error;
use log::info;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use web_time::Instant;

use crate::config::ConfigError;
use crate::config::ExportConfig;
use crate::config::validate_filename;
use crate::enums::ExportStage;
use crate::enums::Threshold;
use crate::marching_cubes::IsosurfaceExtractor;
use crate::smoothing::MeshSmoother;
use crate::smoothing::SmoothingError;
use crate::stl;
use crate::stl::StlError;
use crate::volume::Volume;
use crate::volume::VolumeError;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Invalid volume: {0}")]
    InvalidVolume(#[from] VolumeError),

    #[error("Smoothing failed: {0}")]
    Smoothing(#[from] SmoothingError),

    #[error("STL serialization failed: {0}")]
    Serialization(#[from] StlError),

    #[error("Invalid filename: {0}")]
    InvalidFilename(#[from] ConfigError),

    #[error("Export cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export task failed: {0}")]
    Join(String),
}

impl ExportError {
    /// The stage that produced the error, if it came from one
    pub fn stage(&self) -> Option<ExportStage> {
        match self {
            ExportError::InvalidVolume(_) => Some(ExportStage::MarchingCubes),
            ExportError::Smoothing(_) => Some(ExportStage::Smoothing),
            ExportError::Serialization(_) | ExportError::Io(_) => Some(ExportStage::Writing),
            ExportError::InvalidFilename(_) | ExportError::Cancelled | ExportError::Join(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportState {
    #[default]
    Idle,
    Extracting,
    Smoothing,
    Writing,
    Complete,
    Error,
    Cancelled,
}

impl ExportState {
    /// `true` once a run has ended, successfully or not
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExportState::Complete | ExportState::Error | ExportState::Cancelled
        )
    }
}

/// Timings in milliseconds and mesh size, filled in as stages finish.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportMetrics {
    pub extraction_time_ms: Option<f64>,
    pub smoothing_time_ms: Option<f64>,
    pub write_time_ms: Option<f64>,
    pub total_time_ms: Option<f64>,
    pub triangle_count: Option<usize>,
    pub vertex_count: Option<usize>,
}

impl fmt::Display for ExportMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ms(value: Option<f64>) -> String {
            value.map_or_else(|| "-".to_string(), |v| format!("{v:.1} ms"))
        }
        fn count(value: Option<usize>) -> String {
            value.map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "{} triangles, {} vertices, extraction {}, smoothing {}, writing {}, total {}",
            count(self.triangle_count),
            count(self.vertex_count),
            ms(self.extraction_time_ms),
            ms(self.smoothing_time_ms),
            ms(self.write_time_ms),
            ms(self.total_time_ms),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ExportEvent {
    Progress {
        stage: ExportStage,
        metrics: ExportMetrics,
    },
    Failed {
        stage: ExportStage,
        reason: String,
    },
    Cancelled {
        stage: ExportStage,
    },
}

impl ExportEvent {
    pub fn stage(&self) -> ExportStage {
        match self {
            ExportEvent::Progress { stage, .. }
            | ExportEvent::Failed { stage, .. }
            | ExportEvent::Cancelled { stage } => *stage,
        }
    }
}

/// Shared flag a host sets to abandon a running export.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What to export: output name, isosurface threshold, smoothing on or off.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// File name without the `.stl` extension
    pub filename: String,
    #[serde(default)]
    pub threshold: Threshold,
    #[serde(default)]
    pub smoothing: bool,
}

impl ExportRequest {
    pub fn new(filename: impl Into<String>, threshold: impl Into<Threshold>) -> Self {
        Self {
            filename: filename.into(),
            threshold: threshold.into(),
            smoothing: false,
        }
    }

    pub fn with_smoothing(mut self, smoothing: bool) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn file_name(&self) -> String {
        format!("{}.stl", self.filename)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportOutput {
    pub bytes: Vec<u8>,
    pub metrics: ExportMetrics,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Default)]
pub struct ExportPipeline {
    config: ExportConfig,
    state: ExportState,
}

impl ExportPipeline {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            state: ExportState::Idle,
        }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    /// Run one export and return the encoded STL.
    ///
    /// # Errors
    ///
    /// Fails on an invalid filename or volume, on a smoothing or
    /// serialization failure, or with [`ExportError::Cancelled`] when the
    /// token is set before a stage starts. No bytes are returned in any of
    /// these cases.
    pub fn run(
        &mut self,
        volume: &Volume,
        request: &ExportRequest,
        cancel: &CancellationToken,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> Result<ExportOutput, ExportError> {
        let (bytes, metrics) = self.produce(volume, request, cancel, observer)?;
        self.complete(&metrics, cancel, observer)?;
        Ok(ExportOutput { bytes, metrics })
    }

    /// Run one export and write it to `<dir>/<filename>.stl`.
    ///
    /// The `Complete` event is only sent once the file has been flushed to
    /// disk.
    pub fn export_to_path(
        &mut self,
        volume: &Volume,
        request: &ExportRequest,
        dir: impl AsRef<Path>,
        cancel: &CancellationToken,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> Result<(PathBuf, ExportMetrics), ExportError> {
        let (bytes, metrics) = self.produce(volume, request, cancel, observer)?;
        // Final cancellation check, before anything touches the disk
        self.checkpoint(ExportStage::Complete, cancel, observer)?;

        let path = dir.as_ref().join(request.file_name());
        if let Err(e) = write_file(&path, &bytes) {
            return Err(self.fail(ExportStage::Writing, e.into(), observer));
        }
        info!("wrote {} bytes to {}", bytes.len(), path.display());

        self.finish(&metrics, observer);
        Ok((path, metrics))
    }

    fn produce(
        &mut self,
        volume: &Volume,
        request: &ExportRequest,
        cancel: &CancellationToken,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> Result<(Vec<u8>, ExportMetrics), ExportError> {
        self.state = ExportState::Idle;
        if let Err(e) = validate_filename(&request.filename) {
            error!("rejected export {:?}: {e}", request.filename);
            self.state = ExportState::Error;
            return Err(e.into());
        }

        let threshold = request.threshold.value();
        let mut metrics = ExportMetrics::default();
        info!(
            "exporting {} at {} (smoothing {})",
            request.file_name(),
            request.threshold,
            if request.smoothing { "on" } else { "off" }
        );

        self.checkpoint(ExportStage::MarchingCubes, cancel, observer)?;
        self.state = ExportState::Extracting;
        let started = Instant::now();
        let mut mesh = match IsosurfaceExtractor::new(self.config.marching_cubes)
            .extract(volume, threshold)
        {
            Ok(mesh) => mesh,
            Err(e) => return Err(self.fail(ExportStage::MarchingCubes, e.into(), observer)),
        };
        metrics.extraction_time_ms = Some(elapsed_ms(started));
        metrics.triangle_count = Some(mesh.triangle_count());
        metrics.vertex_count = Some(mesh.vertex_count());
        if mesh.is_empty() {
            info!("threshold {threshold} produced an empty surface");
        }
        self.progress(ExportStage::MarchingCubes, &metrics, observer);

        if request.smoothing {
            self.checkpoint(ExportStage::Smoothing, cancel, observer)?;
            self.state = ExportState::Smoothing;
            let smoothing_started = Instant::now();
            let smoother = MeshSmoother::new(self.config.smoothing)
                .with_area_weighted_normals(self.config.marching_cubes.area_weighted_normals);
            mesh = match smoother.smooth(&mesh) {
                Ok(mesh) => mesh,
                Err(e) => return Err(self.fail(ExportStage::Smoothing, e.into(), observer)),
            };
            metrics.smoothing_time_ms = Some(elapsed_ms(smoothing_started));
            self.progress(ExportStage::Smoothing, &metrics, observer);
        }

        self.checkpoint(ExportStage::Writing, cancel, observer)?;
        self.state = ExportState::Writing;
        let writing_started = Instant::now();
        let bytes = match stl::write_stl(&mesh, self.config.format, &self.config.solid_name) {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(ExportStage::Writing, e.into(), observer)),
        };
        metrics.write_time_ms = Some(elapsed_ms(writing_started));
        metrics.total_time_ms = Some(elapsed_ms(started));
        self.progress(ExportStage::Writing, &metrics, observer);

        Ok((bytes, metrics))
    }

    fn complete(
        &mut self,
        metrics: &ExportMetrics,
        cancel: &CancellationToken,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> Result<(), ExportError> {
        self.checkpoint(ExportStage::Complete, cancel, observer)?;
        self.finish(metrics, observer);
        Ok(())
    }

    fn finish(&mut self, metrics: &ExportMetrics, observer: &mut impl FnMut(&ExportEvent)) {
        self.state = ExportState::Complete;
        observer(&ExportEvent::Progress {
            stage: ExportStage::Complete,
            metrics: ExportMetrics::default(),
        });
        info!("export complete: {metrics}");
    }

    fn progress(
        &self,
        stage: ExportStage,
        metrics: &ExportMetrics,
        observer: &mut impl FnMut(&ExportEvent),
    ) {
        debug!("{stage} finished: {metrics}");
        observer(&ExportEvent::Progress {
            stage,
            metrics: metrics.clone(),
        });
    }

    /// Stop with [`ExportError::Cancelled`] if the token is set.
    fn checkpoint(
        &mut self,
        next: ExportStage,
        cancel: &CancellationToken,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> Result<(), ExportError> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        info!("export cancelled before {next}");
        self.state = ExportState::Cancelled;
        observer(&ExportEvent::Cancelled { stage: next });
        Err(ExportError::Cancelled)
    }

    fn fail(
        &mut self,
        stage: ExportStage,
        err: ExportError,
        observer: &mut impl FnMut(&ExportEvent),
    ) -> ExportError {
        error!("export failed during {stage}: {err}");
        self.state = ExportState::Error;
        observer(&ExportEvent::Failed {
            stage,
            reason: err.to_string(),
        });
        err
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Export with the default configuration and binary output.
///
/// Validates `filename`, extracts at `threshold`, optionally smooths and
/// returns the STL bytes. Progress events go to `on_progress` when given.
pub fn export_mesh(
    volume: &Volume,
    filename: &str,
    threshold: Threshold,
    smoothing: bool,
    on_progress: Option<&mut dyn FnMut(&ExportEvent)>,
) -> Result<Vec<u8>, ExportError> {
    let request = ExportRequest::new(filename, threshold).with_smoothing(smoothing);
    let mut ignore = |_: &ExportEvent| {};
    let mut observer: &mut dyn FnMut(&ExportEvent) = match on_progress {
        Some(observer) => observer,
        None => &mut ignore,
    };
    let output = ExportPipeline::new(ExportConfig::default()).run(
        volume,
        &request,
        &CancellationToken::new(),
        &mut observer,
    )?;
    Ok(output.bytes)
}

/// Run an export on tokio's blocking pool.
///
/// Events are forwarded to `events` without waiting on the receiver.
pub async fn export_mesh_async(
    volume: Arc<Volume>,
    request: ExportRequest,
    config: ExportConfig,
    cancel: CancellationToken,
    events: Option<UnboundedSender<ExportEvent>>,
) -> Result<ExportOutput, ExportError> {
    run_blocking(events, move |mut forward| {
        ExportPipeline::new(config).run(&volume, &request, &cancel, &mut forward)
    })
    .await
}

/// Like [`export_mesh_async`], but writes `<dir>/<filename>.stl` before
/// the `Complete` event is sent. A failed write ends in a `Failed` event
/// for the writing stage.
pub async fn export_to_path_async(
    volume: Arc<Volume>,
    request: ExportRequest,
    config: ExportConfig,
    dir: PathBuf,
    cancel: CancellationToken,
    events: Option<UnboundedSender<ExportEvent>>,
) -> Result<(PathBuf, ExportMetrics), ExportError> {
    run_blocking(events, move |mut forward| {
        ExportPipeline::new(config).export_to_path(&volume, &request, &dir, &cancel, &mut forward)
    })
    .await
}

async fn run_blocking<T, F>(
    events: Option<UnboundedSender<ExportEvent>>,
    job: F,
) -> Result<T, ExportError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn FnMut(&ExportEvent)) -> Result<T, ExportError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut forward = |event: &ExportEvent| {
            if let Some(events) = &events {
                // A dropped receiver only means nobody is listening
                let _ = events.send(event.clone());
            }
        };
        job(&mut forward)
    })
    .await
    .map_err(|e| ExportError::Join(e.to_string()))?
}
