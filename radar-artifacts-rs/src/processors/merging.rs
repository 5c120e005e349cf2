//! Merge clusters that resolve to the same artifact.

use std::collections::BTreeMap;

use serde::Serialize;

use super::labeling::ClusterStatistics;

/// Final assignment after merging.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeResult {
    /// Canonical cluster id per detection.
    pub final_ids: Vec<usize>,
    /// Artifact name to the cluster id that represents it.
    pub canonical: BTreeMap<String, usize>,
    /// Original cluster id to canonical id, for clusters with an artifact.
    pub mapping: BTreeMap<usize, usize>,
}

impl MergeResult {
    /// Canonical id for `cluster`; unmapped clusters map to themselves.
    pub fn resolve(&self, cluster: usize) -> usize {
        self.mapping.get(&cluster).copied().unwrap_or(cluster)
    }

    /// Number of distinct final ids.
    pub fn n_final_clusters(&self) -> usize {
        let mut ids = self.final_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Unifies cluster ids sharing an artifact name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterMerger;

impl ClusterMerger {
    pub fn new() -> Self {
        Self
    }

    /// Build the canonical mapping and apply it to `assignments`.
    ///
    /// Clusters are visited in ascending id order; the first id seen for a
    /// non-empty artifact name becomes canonical for it.
    pub fn merge(
        &self,
        stats: &BTreeMap<usize, ClusterStatistics>,
        assignments: &[usize],
    ) -> MergeResult {
        let mut canonical: BTreeMap<String, usize> = BTreeMap::new();
        let mut mapping: BTreeMap<usize, usize> = BTreeMap::new();

        for (&cluster, s) in stats {
            if s.artifact.is_empty() {
                continue;
            }
            let target = *canonical.entry(s.artifact.clone()).or_insert(cluster);
            if target != cluster {
                log::debug!("merging cluster {} into {} ({})", cluster, target, s.artifact);
            }
            mapping.insert(cluster, target);
        }

        let mut result = MergeResult {
            final_ids: Vec::new(),
            canonical,
            mapping,
        };
        result.final_ids = assignments.iter().map(|&c| result.resolve(c)).collect();

        log::info!(
            "merged {} clusters into {} artifact groups",
            stats.len(),
            result.canonical.len()
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::labeling::{ArtifactClassifier, ZScoreBucketClassifier};

    fn stats_for(aggregate: f64) -> ClusterStatistics {
        let a = ZScoreBucketClassifier.classify(aggregate, &[]);
        ClusterStatistics {
            size: 1,
            feature_means: vec![],
            feature_zscores: vec![],
            aggregate_zscore: aggregate,
            artifact: a.artifact,
            artifact_index: a.index,
            confidence: a.confidence,
        }
    }

    #[test]
    fn test_same_artifact_merges() {
        // 22 and 25 both land in bucket 2
        let mut stats = BTreeMap::new();
        stats.insert(0, stats_for(22.0));
        stats.insert(1, stats_for(3.0));
        stats.insert(2, stats_for(25.0));

        let result = ClusterMerger::new().merge(&stats, &[0, 1, 2, 2, 0]);

        assert_eq!(result.final_ids, vec![0, 1, 0, 0, 0]);
        assert_eq!(result.canonical["clutter"], 0);
        assert_eq!(result.canonical["multipath"], 1);
        assert_eq!(result.mapping[&2], 0);
        assert_eq!(result.n_final_clusters(), 2);
    }

    #[test]
    fn test_canonical_is_lowest_id() {
        let mut stats = BTreeMap::new();
        stats.insert(7, stats_for(55.0));
        stats.insert(4, stats_for(51.0));
        stats.insert(9, stats_for(59.0));

        let result = ClusterMerger::new().merge(&stats, &[9, 7, 4]);
        assert_eq!(result.final_ids, vec![4, 4, 4]);
    }

    #[test]
    fn test_empty_artifact_left_unmapped() {
        let mut stats = BTreeMap::new();
        stats.insert(0, stats_for(1.0));
        let mut blank = stats_for(2.0);
        blank.artifact.clear();
        stats.insert(1, blank.clone());
        stats.insert(2, blank);

        let result = ClusterMerger::new().merge(&stats, &[0, 1, 2]);
        assert_eq!(result.final_ids, vec![0, 1, 2]);
        assert!(!result.mapping.contains_key(&1));
        assert_eq!(result.resolve(2), 2);
    }

    #[test]
    fn test_every_detection_assigned() {
        let mut stats = BTreeMap::new();
        for i in 0..6 {
            stats.insert(i, stats_for(i as f64 * 7.0));
        }
        let assignments: Vec<usize> = (0..60).map(|i| i % 6).collect();

        let result = ClusterMerger::new().merge(&stats, &assignments);
        assert_eq!(result.final_ids.len(), assignments.len());
        for a in 0..6 {
            for b in 0..6 {
                if stats[&a].artifact == stats[&b].artifact {
                    assert_eq!(result.resolve(a), result.resolve(b));
                }
            }
        }
        // aggregates 0, 7, 14, 21, 28, 35 fall in buckets 0, 0, 1, 2, 2, 3
        assert_eq!(result.n_final_clusters(), 4);
    }
}
