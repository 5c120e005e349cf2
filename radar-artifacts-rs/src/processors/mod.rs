//! Data processing modules.

pub mod clustering;
pub mod encoder;
pub mod labeling;
pub mod merging;
pub mod mixture;
pub mod outliers;
pub mod pipeline;

// Re-export key types for convenience
pub use clustering::{ClusterEngine, ClusterError, ClusterOutcome};
pub use encoder::{EncoderError, Encoding, LatentEncoder, TrainedEncoder};
pub use labeling::{
    ArtifactClassifier, ArtifactLabeler, ClusterStatistics, LabelError, ZScoreBucketClassifier,
};
pub use merging::{ClusterMerger, MergeResult};
pub use mixture::{FitResult, MixtureError, MixtureState};
pub use outliers::{OutlierDetector, OutlierError, OutlierSplit};
pub use pipeline::{run_pipeline, PipelineError, PipelineReport, RunQuality};
