//! Per-test-case labeling pipeline.
//!
//! reference statistics → train → encode → outliers → cluster → label → merge

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use super::clustering::{ClusterEngine, ClusterError};
use super::encoder::{EncoderError, LatentEncoder};
use super::labeling::{ArtifactClassifier, ArtifactLabeler, ClusterStatistics, LabelError};
use super::merging::{ClusterMerger, MergeResult};
use super::outliers::{OutlierDetector, OutlierError};
use crate::config::PipelineConfig;
use crate::core::loaders::DetectionTable;
use crate::core::transforms::{non_finite_rows, ReferenceStats};

/// Errors that abort a test case.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("data error: {0}")]
    Data(String),

    #[error("numeric instability: {0}")]
    NumericInstability(String),

    #[error("unrecoverable clustering failure: {0}")]
    UnrecoverableFit(#[source] ClusterError),

    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("outlier detection error: {0}")]
    Outlier(#[from] OutlierError),

    #[error("clustering error: {0}")]
    Cluster(#[source] ClusterError),

    #[error("labeling error: {0}")]
    Label(#[from] LabelError),
}

impl From<ClusterError> for PipelineError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NumericInstability { .. } => Self::NumericInstability(e.to_string()),
            ClusterError::UnrecoverableFit { .. } => Self::UnrecoverableFit(e),
            other => Self::Cluster(other),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Whether the run's output can be trusted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunQuality {
    Clean,
    Degraded { reason: String },
}

impl RunQuality {
    pub fn is_clean(&self) -> bool {
        matches!(self, RunQuality::Clean)
    }
}

/// Everything one test case produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Cluster id per detection before merging.
    pub raw_ids: Vec<usize>,
    /// Number of raw cluster ids, outlier cluster included.
    pub n_clusters: usize,
    pub outlier_cluster: Option<usize>,
    pub statistics: BTreeMap<usize, ClusterStatistics>,
    pub merge: MergeResult,
    pub outlier_threshold: f64,
    pub n_outliers: usize,
    /// Detections removed for NaN latent codes or clustering input.
    pub nan_rows_dropped: usize,
    pub converged: bool,
    pub attempts: usize,
    pub diagnostics: Vec<String>,
    pub final_loss: Option<f64>,
    pub quality: RunQuality,
}

impl PipelineReport {
    /// Canonical cluster id per detection.
    pub fn final_ids(&self) -> &[usize] {
        &self.merge.final_ids
    }
}

/// Run the full labeling pipeline on one detection table.
///
/// Refined labels are written into `table`. Rows with a NaN or infinite
/// feature are left out of training and get a NaN latent code, so they are
/// dropped by the outlier split and end up in the outlier cluster.
pub fn run_pipeline(
    table: &mut DetectionTable,
    config: &PipelineConfig,
    classifier: &dyn ArtifactClassifier,
) -> Result<PipelineReport> {
    if table.is_empty() {
        return Err(PipelineError::Data("detection table is empty".to_string()));
    }
    if table.features.n_rows() != table.len() {
        return Err(PipelineError::Data(format!(
            "feature matrix has {} rows, detection table has {}",
            table.features.n_rows(),
            table.len()
        )));
    }
    let n = table.len();

    let reference = ReferenceStats::compute(&table.features, config.labeling.std_floor);

    let incomplete = non_finite_rows(&table.features);
    let training_features = if incomplete.is_empty() {
        table.features.clone()
    } else {
        log::info!(
            "{} detections with missing or non-finite features excluded from training",
            incomplete.len()
        );
        let complete: Vec<usize> = (0..n)
            .filter(|i| incomplete.binary_search(i).is_err())
            .collect();
        if complete.is_empty() {
            return Err(PipelineError::NumericInstability(
                "every detection has missing or non-finite features".to_string(),
            ));
        }
        table.features.select_rows(&complete)
    };

    log::info!(
        "training auto-encoder on {} detections, {} features",
        training_features.n_rows(),
        training_features.n_cols()
    );
    let encoder =
        LatentEncoder::new(table.features.n_cols(), &config.encoder).train(&training_features)?;
    let mut encoding = encoder.encode(&table.features)?;
    // Rows the encoder never saw get no latent code
    encoding.latent_means.fill_rows(&incomplete, f32::NAN);
    for &i in &incomplete {
        encoding.reconstruction_errors[i] = f64::NAN;
    }

    let split = OutlierDetector::new(&config.outliers)
        .split(&encoding.reconstruction_errors, &encoding.latent_means)?;

    let clusters =
        ClusterEngine::new(&config.clustering).cluster(&encoding.latent_means, &split.inliers)?;

    let labeler = ArtifactLabeler::new(&config.labeling, classifier);
    let statistics = labeler.label(table, &clusters.assignments, &reference)?;

    let merge = ClusterMerger::new().merge(&statistics, &clusters.assignments);

    let mut reasons = Vec::new();
    if split.degraded {
        reasons.push(format!(
            "{:.1}% of latent codes were NaN and dropped without retraining",
            split.nan_fraction * 100.0
        ));
    }
    if !clusters.converged {
        reasons.push("mixture fit did not converge".to_string());
    }
    let quality = if reasons.is_empty() {
        RunQuality::Clean
    } else {
        RunQuality::Degraded {
            reason: reasons.join("; "),
        }
    };

    log::info!(
        "{} detections -> {} clusters -> {} after merging",
        n,
        clusters.n_clusters,
        merge.n_final_clusters()
    );

    Ok(PipelineReport {
        raw_ids: clusters.assignments,
        n_clusters: clusters.n_clusters,
        outlier_cluster: clusters.outlier_cluster,
        statistics,
        merge,
        outlier_threshold: split.threshold,
        n_outliers: split.outliers.len(),
        nan_rows_dropped: split.dropped.len() + clusters.dropped_rows.len(),
        converged: clusters.converged,
        attempts: clusters.attempts,
        diagnostics: clusters.diagnostics,
        final_loss: encoder.epoch_losses().last().copied(),
        quality,
    })
}
