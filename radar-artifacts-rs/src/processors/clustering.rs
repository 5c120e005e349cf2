//! Retry-hardened Dirichlet-process mixture clustering of latent codes.
//!
//! Only inlier detections are clustered. Every other detection (outliers and
//! rows dropped for NaN latent codes) shares one extra cluster id placed
//! directly after the dense inlier ids.
//!
//! # Retry protocol
//!
//! Up to `max_retries` attempts are made. Attempt `i` seeds with k-means on
//! even `i` and random responsibilities on odd `i`, and allows
//! `(i + 1) * 100` iterations. A converged fit ends the loop. A fit rejected
//! for non-finite rows drops those rows and repeats the same attempt when
//! they are below `nan_fraction_limit` of the input, and is fatal otherwise.
//! Without a clean convergence the last fitted state is used and a
//! diagnostic is returned.

use std::collections::HashMap;

use thiserror::Error;

use super::mixture::{self, FitResult, InitStrategy, MixtureError, MixtureParams, MixtureState};
use crate::config::ClusteringConfig;
use crate::core::transforms::{fraction, Matrix};

/// Errors that can occur during clustering.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{:.1}% of clustering input rows are non-finite (limit {:.1}%)", .fraction * 100.0, .limit * 100.0)]
    NumericInstability { fraction: f64, limit: f64 },

    #[error("mixture fit failed in all {attempts} attempts: {source}")]
    UnrecoverableFit {
        attempts: usize,
        #[source]
        source: MixtureError,
    },

    #[error("inlier index {index} is out of range for {rows} rows")]
    IndexOutOfRange { index: usize, rows: usize },
}

/// Result type for clustering operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster assignment for every detection plus fit diagnostics.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// Cluster id per detection, aligned with the input rows.
    pub assignments: Vec<usize>,
    /// Total number of cluster ids in use, outlier cluster included.
    pub n_clusters: usize,
    /// Id shared by every non-clustered detection, if there are any.
    pub outlier_cluster: Option<usize>,
    /// Last fitted mixture; `None` when there was nothing to fit.
    pub state: Option<MixtureState>,
    pub converged: bool,
    /// Attempts consumed from the retry budget.
    pub attempts: usize,
    /// Rows removed from the clustering input for non-finite values.
    pub dropped_rows: Vec<usize>,
    pub diagnostics: Vec<String>,
}

/// Map raw component ids to a dense range in order of first appearance.
///
/// Returns the relabeled ids and the number of distinct components.
pub fn dense_relabel(raw: &[usize]) -> (Vec<usize>, usize) {
    let mut component_to_cluster: HashMap<usize, usize> = HashMap::new();
    let mut next_cluster_id = 0usize;

    let labels = raw
        .iter()
        .map(|&component| {
            *component_to_cluster.entry(component).or_insert_with(|| {
                let id = next_cluster_id;
                next_cluster_id += 1;
                id
            })
        })
        .collect();

    (labels, next_cluster_id)
}

/// Dirichlet-process mixture clustering with bounded retries.
#[derive(Debug, Clone)]
pub struct ClusterEngine {
    config: ClusteringConfig,
}

impl ClusterEngine {
    pub fn new(config: &ClusteringConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn params_for_attempt(&self, attempt: usize) -> MixtureParams {
        MixtureParams {
            n_components: self.config.truncation,
            concentration: self.config.effective_concentration(),
            tol: self.config.tol,
            reg_covar: self.config.reg_covar,
            max_iter: (attempt + 1) * 100,
            init: if attempt % 2 == 0 {
                InitStrategy::KMeans
            } else {
                InitStrategy::Random
            },
            seed: self.config.seed.wrapping_add(attempt as u64),
        }
    }

    /// Run the retry protocol on `working` rows of `latents`.
    ///
    /// `working` shrinks when rows are dropped for non-finite values; the
    /// dropped original row indices are appended to `dropped`.
    fn fit_with_retries(
        &self,
        latents: &Matrix,
        working: &mut Vec<usize>,
        dropped: &mut Vec<usize>,
    ) -> Result<(FitResult, usize, Vec<String>)> {
        let max_attempts = self.config.max_retries.max(1);
        let mut diagnostics = Vec::new();
        let mut last_fit: Option<FitResult> = None;
        let mut last_error: Option<MixtureError> = None;
        let mut x = mixture::to_dmatrix(&latents.select_rows(working));
        let mut attempt = 0;

        while attempt < max_attempts {
            let params = self.params_for_attempt(attempt);
            log::debug!(
                "clustering attempt {}/{}: {:?} init, max_iter {}",
                attempt + 1,
                max_attempts,
                params.init,
                params.max_iter
            );

            match mixture::fit(&x, &params) {
                Ok(result) => {
                    attempt += 1;
                    if result.converged {
                        log::info!(
                            "mixture converged on attempt {} after {} iterations",
                            attempt,
                            result.n_iter
                        );
                        last_fit = Some(result);
                        break;
                    }
                    for d in &result.diagnostics {
                        log::warn!("attempt {}: {}", attempt, d);
                    }
                    diagnostics.extend(result.diagnostics.iter().cloned());
                    last_fit = Some(result);
                }
                Err(MixtureError::NonFiniteInput { rows }) => {
                    let frac = fraction(rows.len(), x.nrows());
                    if frac >= self.config.nan_fraction_limit {
                        return Err(ClusterError::NumericInstability {
                            fraction: frac,
                            limit: self.config.nan_fraction_limit,
                        });
                    }
                    log::warn!(
                        "dropping {} non-finite rows from clustering input and retrying attempt {}",
                        rows.len(),
                        attempt + 1
                    );
                    let mut keep = vec![true; working.len()];
                    for &r in &rows {
                        keep[r] = false;
                        dropped.push(working[r]);
                    }
                    let mut position = 0;
                    working.retain(|_| {
                        let k = keep[position];
                        position += 1;
                        k
                    });
                    x = mixture::to_dmatrix(&latents.select_rows(working));
                }
                Err(e) => {
                    attempt += 1;
                    log::warn!("clustering attempt {} failed: {}", attempt, e);
                    diagnostics.push(format!("attempt {} failed: {}", attempt, e));
                    last_error = Some(e);
                }
            }
        }

        match (last_fit, last_error) {
            (Some(fit), _) => Ok((fit, attempt, diagnostics)),
            (None, Some(source)) => Err(ClusterError::UnrecoverableFit {
                attempts: attempt,
                source,
            }),
            (None, None) => Err(ClusterError::UnrecoverableFit {
                attempts: attempt,
                source: MixtureError::EmptyInput,
            }),
        }
    }

    /// Cluster the `inliers` rows of `latents`.
    ///
    /// Inlier ids form the dense range `[0, K)` ordered by first appearance of
    /// each fitted component; every other row gets id `K`.
    pub fn cluster(&self, latents: &Matrix, inliers: &[usize]) -> Result<ClusterOutcome> {
        let n = latents.n_rows();
        if let Some(&index) = inliers.iter().find(|&&i| i >= n) {
            return Err(ClusterError::IndexOutOfRange { index, rows: n });
        }

        let mut working = inliers.to_vec();
        let mut dropped = Vec::new();

        let (state, attempts, mut diagnostics) = if working.is_empty() {
            log::warn!("no inliers to cluster");
            (None, 0, vec!["no inliers to cluster".to_string()])
        } else {
            let (fit, attempts, diagnostics) =
                self.fit_with_retries(latents, &mut working, &mut dropped)?;
            (Some(fit), attempts, diagnostics)
        };
        let converged = state.as_ref().is_some_and(|f| f.converged);

        if state.is_some() && !converged {
            let message = format!(
                "no clean convergence after {} attempts; using the last fitted state",
                attempts
            );
            log::warn!("{}", message);
            diagnostics.push(message);
        }

        let mut assignments: Vec<Option<usize>> = vec![None; n];
        let mut n_inlier_clusters = 0;
        let state = match state {
            Some(fit) => {
                let x = mixture::to_dmatrix(&latents.select_rows(&working));
                let (labels, k) = dense_relabel(&fit.state.predict(&x));
                for (&row, label) in working.iter().zip(labels) {
                    assignments[row] = Some(label);
                }
                n_inlier_clusters = k;
                Some(fit.state)
            }
            None => None,
        };

        let has_outliers = assignments.iter().any(Option::is_none);
        let outlier_cluster = has_outliers.then_some(n_inlier_clusters);
        let n_clusters = n_inlier_clusters + usize::from(has_outliers);
        let assignments: Vec<usize> = assignments
            .into_iter()
            .map(|a| a.unwrap_or(n_inlier_clusters))
            .collect();

        log::info!(
            "{} inlier clusters, {} rows in outlier cluster",
            n_inlier_clusters,
            n - working.len()
        );

        Ok(ClusterOutcome {
            assignments,
            n_clusters,
            outlier_cluster,
            state,
            converged,
            attempts,
            dropped_rows: dropped,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::StandardNormal;
    use std::collections::BTreeSet;

    /// Two tight 3-D blobs, blob-major, `per_blob` rows each.
    fn latents(per_blob: usize) -> Matrix {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let mut data = Vec::new();
        for centre in [-5.0f32, 5.0] {
            for _ in 0..per_blob {
                for _ in 0..3 {
                    data.push(centre + 0.2 * rng.sample::<f32, _>(StandardNormal));
                }
            }
        }
        Matrix::new(data, 3).unwrap()
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            truncation: 5,
            ..ClusteringConfig::default()
        }
    }

    #[test]
    fn test_dense_relabel_first_seen_order() {
        let (labels, k) = dense_relabel(&[5, 2, 5, 7, 2]);
        assert_eq!(labels, vec![0, 1, 0, 2, 1]);
        assert_eq!(k, 3);

        let (labels, k) = dense_relabel(&[]);
        assert!(labels.is_empty());
        assert_eq!(k, 0);
    }

    #[test]
    fn test_inlier_ids_are_dense_and_outliers_follow() {
        let x = latents(50);
        let outliers = [3usize, 60, 99];
        let inliers: Vec<usize> = (0..100).filter(|i| !outliers.contains(i)).collect();

        let outcome = ClusterEngine::new(&config()).cluster(&x, &inliers).unwrap();

        let inlier_ids: BTreeSet<usize> = inliers.iter().map(|&i| outcome.assignments[i]).collect();
        let k = inlier_ids.len();
        assert_eq!(inlier_ids, (0..k).collect::<BTreeSet<_>>());

        assert_eq!(outcome.outlier_cluster, Some(k));
        for &i in &outliers {
            assert_eq!(outcome.assignments[i], k);
        }
        assert_eq!(outcome.n_clusters, k + 1);
        assert_eq!(outcome.assignments.len(), 100);
    }

    #[test]
    fn test_no_outlier_cluster_without_outliers() {
        let x = latents(30);
        let inliers: Vec<usize> = (0..60).collect();

        let outcome = ClusterEngine::new(&config()).cluster(&x, &inliers).unwrap();
        assert_eq!(outcome.outlier_cluster, None);
        let max_id = *outcome.assignments.iter().max().unwrap();
        assert_eq!(outcome.n_clusters, max_id + 1);
    }

    #[test]
    fn test_blobs_do_not_share_clusters() {
        let x = latents(40);
        let inliers: Vec<usize> = (0..80).collect();

        let outcome = ClusterEngine::new(&config()).cluster(&x, &inliers).unwrap();
        let first: BTreeSet<usize> = outcome.assignments[..40].iter().copied().collect();
        let second: BTreeSet<usize> = outcome.assignments[40..].iter().copied().collect();
        assert!(first.is_disjoint(&second));
    }

    #[test]
    fn test_nan_rows_dropped_without_consuming_retry() {
        let mut rows: Vec<Vec<f32>> = latents(50).rows().map(|r| r.to_vec()).collect();
        rows[17][1] = f32::NAN;
        let x = Matrix::from_rows(&rows).unwrap();
        let inliers: Vec<usize> = (0..100).collect();

        let cfg = ClusteringConfig {
            max_retries: 1,
            ..config()
        };
        let outcome = ClusterEngine::new(&cfg).cluster(&x, &inliers).unwrap();

        assert_eq!(outcome.dropped_rows, vec![17]);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.outlier_cluster, Some(outcome.assignments[17]));
    }

    #[test]
    fn test_nan_rows_at_limit_are_fatal() {
        let mut rows: Vec<Vec<f32>> = latents(10).rows().map(|r| r.to_vec()).collect();
        rows[0][0] = f32::NAN;
        let x = Matrix::from_rows(&rows).unwrap();
        let inliers: Vec<usize> = (0..20).collect();

        // 1 of 20 rows = 5%
        let result = ClusterEngine::new(&config()).cluster(&x, &inliers);
        assert!(matches!(result, Err(ClusterError::NumericInstability { .. })));
    }

    #[test]
    fn test_unconverged_fit_is_not_fatal() {
        let x = latents(20);
        let inliers: Vec<usize> = (0..40).collect();
        let cfg = ClusteringConfig {
            tol: 0.0,
            max_retries: 2,
            ..config()
        };

        let outcome = ClusterEngine::new(&cfg).cluster(&x, &inliers).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.state.is_some());
        assert!(outcome
            .diagnostics
            .last()
            .unwrap()
            .contains("no clean convergence"));
    }

    #[test]
    fn test_all_outliers() {
        let x = latents(5);
        let outcome = ClusterEngine::new(&config()).cluster(&x, &[]).unwrap();

        assert!(outcome.assignments.iter().all(|&a| a == 0));
        assert_eq!(outcome.outlier_cluster, Some(0));
        assert_eq!(outcome.n_clusters, 1);
        assert!(outcome.state.is_none());
    }

    #[test]
    fn test_attempt_schedule() {
        let engine = ClusterEngine::new(&config());
        let p0 = engine.params_for_attempt(0);
        let p1 = engine.params_for_attempt(1);
        let p2 = engine.params_for_attempt(2);

        assert_eq!(p0.init, InitStrategy::KMeans);
        assert_eq!(p1.init, InitStrategy::Random);
        assert_eq!(p2.init, InitStrategy::KMeans);
        assert_eq!(p0.max_iter, 100);
        assert_eq!(p1.max_iter, 200);
        assert_eq!(p2.max_iter, 300);
    }

    #[test]
    fn test_index_out_of_range() {
        let x = latents(2);
        let result = ClusterEngine::new(&config()).cluster(&x, &[0, 9]);
        assert!(matches!(
            result,
            Err(ClusterError::IndexOutOfRange { index: 9, rows: 4 })
        ));
    }
}
