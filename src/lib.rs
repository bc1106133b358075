//! # segviz
//!
//! Post-processing and delivery of segmented medical image volumes.
//!
//! A segmentation model (treated as an external [`predictor::Predictor`])
//! turns an input image into a NIfTI label volume. This crate takes it from
//! there:
//!  - Volumetric analysis: liver volume plus the number and volume of
//!    individual tumors, found as 6-connected components of the tumor label.
//!  - Surface extraction: one smoothed triangle mesh per organ label, written
//!    as Wavefront OBJ.
//!  - Result caching keyed by the MD5 of the input image bytes, so an image
//!    that was already processed skips segmentation and meshing.
//!  - Delivery of patient metadata, metrics and meshes to a remote viewer
//!    over a length-prefixed TCP protocol.
//!
//! The [`pipeline::Pipeline`] ties these together; each component can also
//! be used on its own.
//!
//! Label volumes are assumed to have the following attributes:
//!   - 3D (a trailing time axis of length 1 is accepted)
//!   - Non-negative integer voxel values, 0 being background
//!   - Positive voxel spacing in millimeters in the first three `pixdim`
//!     entries
//!
//! # Examples
//!
//! ## Computing metrics and meshes for a label volume
//!
//! ```no_run
//! # use segviz::{MeshExtractor, SmoothingMode, VolumeAnalyzer, VolumeLoader};
//! # use std::collections::BTreeMap;
//! let volume = VolumeLoader::load_from_nifti("predictions/case_001_pred.nii.gz")
//!     .expect("should have loaded the label volume");
//! let metrics = VolumeAnalyzer::new(8, 9).analyze(&volume);
//! println!("liver: {} ml, tumors: {}", metrics.liver_volume_ml, metrics.tumor_count);
//!
//! let extractor = MeshExtractor::new(SmoothingMode::default(), BTreeMap::new());
//! let meshes = extractor
//!     .extract_meshes(&volume, "predictions/unity_assets", "case_001")
//!     .expect("should have created the output directory");
//! ```

pub mod cache;
pub mod config;
pub mod delivery;
pub mod enums;
mod grid;
pub mod mesh_extractor;
pub mod metrics;
pub mod pipeline;
pub mod predictor;
mod smoothing;
pub mod volume;
pub mod volume_loader;

pub use cache::{CacheEntry, CacheError, ResultCache};
pub use config::{Config, ConfigError};
pub use delivery::{DeliveryClient, DeliveryError, FrameWriter, PatientInfo, WirePayload};
pub use enums::{PipelineState, SmoothingMode};
pub use mesh_extractor::{ExtractionError, MeshAsset, MeshError, MeshExtractor, SurfaceMesh};
pub use metrics::{Tumor, VolumeAnalyzer, VolumeMetrics, compute_metrics};
pub use pipeline::{CancellationToken, Pipeline, PipelineError, RunOutcome};
pub use predictor::{CommandPredictor, Predictor, PredictorError};
pub use volume::{LabelVolume, VolumeError};
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
