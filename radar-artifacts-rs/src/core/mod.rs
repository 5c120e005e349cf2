//! Core data types and I/O operations.

pub mod loaders;
pub mod transforms;
pub mod writers;

pub use loaders::{load_detections, DetectionTable, LoaderError};
pub use transforms::{percentile, Matrix, ReferenceStats};
pub use writers::{write_detections_csv, write_statistics_json, WriteError};
