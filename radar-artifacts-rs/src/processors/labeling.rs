//! Cluster statistics and artifact-type assignment.
//!
//! Each cluster is summarized by its per-feature mean and z-score against the
//! run's [`ReferenceStats`]. An [`ArtifactClassifier`] turns that summary into
//! an artifact name and confidence; the default [`ZScoreBucketClassifier`] is
//! a fixed bucket heuristic over the aggregate absolute z-score.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LabelingConfig;
use crate::core::loaders::DetectionTable;
use crate::core::transforms::ReferenceStats;

/// Artifact taxonomy used by [`ZScoreBucketClassifier`], in index order.
pub const ARTIFACT_TYPES: [&str; 10] = [
    "multipath",
    "sidelobe",
    "clutter",
    "ghost",
    "interference",
    "mirror_reflection",
    "range_ambiguity",
    "doppler_ambiguity",
    "second_trip_echo",
    "receiver_noise",
];

/// Errors that can occur during labeling.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("{assignments} cluster assignments for {rows} detections")]
    LengthMismatch { assignments: usize, rows: usize },

    #[error("reference statistics cover {expected} features, table has {found}")]
    FeatureMismatch { expected: usize, found: usize },
}

/// Result type for labeling operations.
pub type Result<T> = std::result::Result<T, LabelError>;

/// Artifact identity chosen for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactAssignment {
    /// Artifact name; empty when the classifier declines to assign one.
    pub artifact: String,
    /// Position in the classifier's taxonomy.
    pub index: Option<usize>,
    /// Confidence percentage in (0, 100].
    pub confidence: f64,
}

/// Strategy mapping a cluster summary to an artifact identity.
pub trait ArtifactClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, aggregate_zscore: f64, feature_zscores: &[f64]) -> ArtifactAssignment;
}

/// Buckets the aggregate z-score in steps of 10 over [`ARTIFACT_TYPES`].
///
/// `index = floor(aggregate / 10) mod 10`, `confidence = 100 / (index + 1)`
/// rounded to two decimals.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZScoreBucketClassifier;

impl ArtifactClassifier for ZScoreBucketClassifier {
    fn name(&self) -> &str {
        "zscore-bucket"
    }

    fn classify(&self, aggregate_zscore: f64, _feature_zscores: &[f64]) -> ArtifactAssignment {
        let bucket = (aggregate_zscore.max(0.0) / 10.0).floor() as usize;
        let index = bucket % ARTIFACT_TYPES.len();
        let confidence = (100.0 / (index + 1) as f64 * 100.0).round() / 100.0;
        ArtifactAssignment {
            artifact: ARTIFACT_TYPES[index].to_string(),
            index: Some(index),
            confidence,
        }
    }
}

/// Statistics record for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatistics {
    pub size: usize,
    pub feature_means: Vec<f64>,
    pub feature_zscores: Vec<f64>,
    /// Sum of absolute finite feature z-scores.
    pub aggregate_zscore: f64,
    pub artifact: String,
    pub artifact_index: Option<usize>,
    pub confidence: f64,
}

/// Computes cluster statistics and writes refined labels.
pub struct ArtifactLabeler<'a> {
    classifier: &'a dyn ArtifactClassifier,
    refinable_classes: Vec<String>,
}

impl<'a> ArtifactLabeler<'a> {
    pub fn new(config: &LabelingConfig, classifier: &'a dyn ArtifactClassifier) -> Self {
        Self {
            classifier,
            refinable_classes: config.refinable_classes.clone(),
        }
    }

    fn summarize(
        &self,
        table: &DetectionTable,
        members: &[usize],
        reference: &ReferenceStats,
    ) -> ClusterStatistics {
        let n_features = table.features.n_cols();
        let mut sums = vec![0.0f64; n_features];
        let mut counts = vec![0usize; n_features];
        for &row in members {
            for (j, &v) in table.features.row(row).iter().enumerate() {
                if v.is_finite() {
                    sums[j] += v as f64;
                    counts[j] += 1;
                }
            }
        }

        let feature_means: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c == 0 { f64::NAN } else { s / c as f64 })
            .collect();
        let feature_zscores: Vec<f64> = feature_means
            .iter()
            .enumerate()
            .map(|(j, m)| (m - reference.mean[j]) / reference.std[j])
            .collect();
        let aggregate_zscore: f64 = feature_zscores
            .iter()
            .filter(|z| z.is_finite())
            .map(|z| z.abs())
            .sum();

        let assignment = self.classifier.classify(aggregate_zscore, &feature_zscores);

        ClusterStatistics {
            size: members.len(),
            feature_means,
            feature_zscores,
            aggregate_zscore,
            artifact: assignment.artifact,
            artifact_index: assignment.index,
            confidence: assignment.confidence,
        }
    }

    /// Summarize every cluster in `assignments` and refine labels in `table`.
    ///
    /// Detections whose class is refinable get the label
    /// `<class><index + 1>` of their cluster's artifact; clusters without an
    /// artifact index leave labels untouched.
    pub fn label(
        &self,
        table: &mut DetectionTable,
        assignments: &[usize],
        reference: &ReferenceStats,
    ) -> Result<BTreeMap<usize, ClusterStatistics>> {
        if assignments.len() != table.len() {
            return Err(LabelError::LengthMismatch {
                assignments: assignments.len(),
                rows: table.len(),
            });
        }
        if reference.n_features() != table.features.n_cols() {
            return Err(LabelError::FeatureMismatch {
                expected: reference.n_features(),
                found: table.features.n_cols(),
            });
        }

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (row, &cluster) in assignments.iter().enumerate() {
            members.entry(cluster).or_default().push(row);
        }

        let view: &DetectionTable = table;
        let stats: BTreeMap<usize, ClusterStatistics> = members
            .par_iter()
            .map(|(&cluster, rows)| (cluster, self.summarize(view, rows, reference)))
            .collect();

        for (cluster, s) in &stats {
            log::debug!(
                "cluster {}: {} detections, aggregate z {:.3} -> {} ({:.2}%)",
                cluster,
                s.size,
                s.aggregate_zscore,
                s.artifact,
                s.confidence
            );
        }

        let mut refined = 0usize;
        for (row, cluster) in assignments.iter().enumerate() {
            let Some(index) = stats.get(cluster).and_then(|s| s.artifact_index) else {
                continue;
            };
            let class = &table.classes[row];
            if self.refinable_classes.iter().any(|c| c == class) {
                table.refined_labels[row] = format!("{}{}", class, index + 1);
                refined += 1;
            }
        }

        log::info!(
            "labeled {} clusters with {}; refined {} detections",
            stats.len(),
            self.classifier.name(),
            refined
        );

        Ok(stats)
    }
}
