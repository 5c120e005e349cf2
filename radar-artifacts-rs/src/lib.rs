//! Unsupervised artifact labeling for radar detections.
//!
//! This crate provides tools for:
//! - Loading per-detection feature tables from CSV
//! - Learning latent codes with a variational auto-encoder (candle)
//! - Flagging outliers by reconstruction error
//! - Dirichlet-process Gaussian mixture clustering with bounded retries
//! - Mapping cluster statistics to artifact types and merging equivalent clusters
//!
//! # Example
//!
//! ```no_run
//! use radar_artifacts::{
//!     core::load_detections,
//!     processors::{run_pipeline, ZScoreBucketClassifier},
//!     PipelineConfig,
//! };
//!
//! let config = PipelineConfig::default();
//! let mut table = load_detections("case_01.csv", &config.data).unwrap();
//! let report = run_pipeline(&mut table, &config, &ZScoreBucketClassifier).unwrap();
//! println!("{} clusters", report.n_clusters);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{
    ClusteringConfig, DataConfig, EncoderConfig, LabelingConfig, OutlierConfig, PipelineConfig,
};
pub use core::loaders::DetectionTable;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
