//! # DICOM-mesh library
//!
//! This crate turns a CT series into a printable surface mesh. It builds on
//! the dicom-rs ecosystem to read a series into a volume of Hounsfield Units,
//! extracts the isosurface at a tissue density threshold with marching
//! cubes, optionally smooths it with a windowed-sinc filter and serializes
//! it to binary or ASCII STL.
//!
//! The export runs as a small state machine which reports stage timings and
//! mesh size to an observer and can be cancelled between stages. Hosts that
//! run on tokio can move the work to the blocking pool with
//! [`export_mesh_async`] and receive progress on a channel.
//!
//! DICOM files are assumed to have the following attributes:
//!  - Axial data set
//!  - No multiframe (always the first frame is used)
//!  - Slices of one series share their size
//!
//! Tissue presets, in Hounsfield Units:
//!  - High density (bone): 300
//!  - Medium density (muscle, organs, brain): 40
//!  - Low density (skin, fat): -50
//!
//! A voxel is inside the surface when its value is at or above the
//! threshold.
//!
//! # Examples
//!
//! ## Exporting the largest series of a directory
//!
//! ```no_run
//! # use dicom_mesh::{DicomRecord, SeriesGrouper, SortBy, TissuePreset, Threshold, VolumeLoader, export_mesh};
//! let records = DicomRecord::scan_directory("dicom").expect("should have read directory");
//! let groups = SeriesGrouper::group(records);
//! let (_, _, _, series) = groups.largest_series().expect("should contain a series");
//! let volume = VolumeLoader::load_series(series, SortBy::ImagePositionPatient)
//!     .expect("should have loaded series");
//! let stl = export_mesh(&volume, "skull", Threshold::Preset(TissuePreset::HighDensity), true, None)
//!     .expect("should have exported mesh");
//! std::fs::write("skull.stl", stl).expect("should have written file");
//! ```
//!
//! ## Observing progress
//!
//! ```
//! # use dicom_mesh::{CancellationToken, ExportConfig, ExportEvent, ExportPipeline, ExportRequest, Volume};
//! let volume = Volume::from_fn((16, 16, 16), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0), |x, y, z| {
//!     let d2 = [x, y, z].iter().map(|&i| (i as f64 - 7.5).powi(2)).sum::<f64>();
//!     if d2 < 25.0 { 1000 } else { 0 }
//! })
//! .unwrap();
//!
//! let mut pipeline = ExportPipeline::new(ExportConfig::default());
//! let output = pipeline
//!     .run(
//!         &volume,
//!         &ExportRequest::new("ball", 500.0),
//!         &CancellationToken::new(),
//!         &mut |event: &ExportEvent| println!("{}", event.stage()),
//!     )
//!     .unwrap();
//! assert_eq!(output.bytes.len(), 84 + 50 * output.metrics.triangle_count.unwrap());
//! ```

pub mod config;
pub mod enums;
pub mod marching_cubes;
pub mod mesh;
pub mod pipeline;
pub mod series;
pub mod smoothing;
pub mod stl;
mod tables;
pub mod volume;
pub mod volume_loader;

pub use config::{ConfigError, ExportConfig, validate_filename};
pub use enums::{ExportStage, SortBy, StlFormat, Threshold, TissuePreset};
pub use marching_cubes::{IsosurfaceExtractor, MarchingCubesConfig};
pub use mesh::Mesh;
pub use pipeline::{
    CancellationToken, ExportError, ExportEvent, ExportMetrics, ExportOutput, ExportPipeline,
    ExportRequest, ExportState, export_mesh, export_mesh_async, export_to_path_async,
};
pub use series::{DicomRecord, SeriesGrouper, SeriesGroups};
pub use smoothing::{MeshSmoother, SmoothingParams};
pub use volume::Volume;
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
