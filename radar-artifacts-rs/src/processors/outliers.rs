//! Reconstruction-error outlier detection and NaN latent screening.
//!
//! A detection is an outlier when its reconstruction error strictly exceeds
//! the configured percentile of the error distribution. Detections whose
//! latent mean contains a NaN are dropped from the working set; when they
//! make up at least `nan_fraction_limit` of the run, the run is flagged as
//! degraded instead of being retrained.

use thiserror::Error;

use crate::config::OutlierConfig;
use crate::core::transforms::{fraction, nan_rows, percentile, Matrix};

/// Errors that can occur during outlier detection.
#[derive(Error, Debug)]
pub enum OutlierError {
    #[error("no finite reconstruction errors to threshold")]
    NoFiniteErrors,

    #[error("percentile {0} is outside [0, 100]")]
    InvalidPercentile(f64),

    #[error("{errors} reconstruction errors for {rows} latent rows")]
    LengthMismatch { errors: usize, rows: usize },
}

/// Result type for outlier operations.
pub type Result<T> = std::result::Result<T, OutlierError>;

/// Partition of detections produced by [`OutlierDetector::split`].
///
/// Every detection index appears in exactly one of `inliers`, `outliers`
/// and `dropped`, each sorted ascending.
#[derive(Debug, Clone)]
pub struct OutlierSplit {
    /// Error threshold, fixed for the run.
    pub threshold: f64,
    /// Detections whose error strictly exceeds `threshold`.
    pub outliers: Vec<usize>,
    /// Detections removed because their latent mean contains a NaN.
    pub dropped: Vec<usize>,
    /// Remaining detections, to be clustered.
    pub inliers: Vec<usize>,
    /// Fraction of detections in `dropped`.
    pub nan_fraction: f64,
    /// True when `nan_fraction` reached the configured limit.
    pub degraded: bool,
}

/// Percentile-threshold outlier detector.
#[derive(Debug, Clone)]
pub struct OutlierDetector {
    percentile: f64,
    nan_fraction_limit: f64,
}

impl OutlierDetector {
    pub fn new(config: &OutlierConfig) -> Self {
        Self {
            percentile: config.percentile,
            nan_fraction_limit: config.nan_fraction_limit,
        }
    }

    /// Threshold `errors` at the configured percentile.
    ///
    /// Non-finite errors are excluded from the percentile and never count as
    /// outliers. Returns the threshold and the ascending outlier indices.
    pub fn threshold(&self, errors: &[f64]) -> Result<(f64, Vec<usize>)> {
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(OutlierError::InvalidPercentile(self.percentile));
        }
        let finite: Vec<f64> = errors.iter().copied().filter(|e| e.is_finite()).collect();
        let threshold =
            percentile(&finite, self.percentile).ok_or(OutlierError::NoFiniteErrors)?;

        let outliers = errors
            .iter()
            .enumerate()
            .filter(|(_, e)| **e > threshold)
            .map(|(i, _)| i)
            .collect();
        Ok((threshold, outliers))
    }

    /// Split detections into inliers, outliers and NaN-dropped rows.
    pub fn split(&self, errors: &[f64], latent_means: &Matrix) -> Result<OutlierSplit> {
        let n = latent_means.n_rows();
        if errors.len() != n {
            return Err(OutlierError::LengthMismatch {
                errors: errors.len(),
                rows: n,
            });
        }

        let dropped = nan_rows(latent_means);
        let nan_fraction = fraction(dropped.len(), n);
        let degraded = !dropped.is_empty() && nan_fraction >= self.nan_fraction_limit;
        if degraded {
            log::warn!(
                "{:.1}% of latent codes contain NaN (limit {:.1}%); dropping them, run quality is degraded",
                nan_fraction * 100.0,
                self.nan_fraction_limit * 100.0
            );
        } else if !dropped.is_empty() {
            log::info!("dropping {} latent codes containing NaN", dropped.len());
        }

        let (threshold, flagged) = self.threshold(errors)?;

        let mut is_dropped = vec![false; n];
        for &i in &dropped {
            is_dropped[i] = true;
        }
        let mut is_outlier = vec![false; n];
        for &i in &flagged {
            is_outlier[i] = true;
        }

        let outliers: Vec<usize> = (0..n).filter(|&i| is_outlier[i] && !is_dropped[i]).collect();
        let inliers: Vec<usize> = (0..n).filter(|&i| !is_outlier[i] && !is_dropped[i]).collect();

        log::info!(
            "outlier threshold {:.6} at p{}: {} outliers, {} inliers",
            threshold,
            self.percentile,
            outliers.len(),
            inliers.len()
        );

        Ok(OutlierSplit {
            threshold,
            outliers,
            dropped,
            inliers,
            nan_fraction,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(p: f64) -> OutlierDetector {
        OutlierDetector::new(&OutlierConfig {
            percentile: p,
            nan_fraction_limit: 0.05,
        })
    }

    fn latents(n: usize) -> Matrix {
        Matrix::new((0..n * 2).map(|v| v as f32).collect(), 2).unwrap()
    }

    #[test]
    fn test_threshold_matches_percentile() {
        let errors: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let (threshold, outliers) = detector(90.0).threshold(&errors).unwrap();

        // rank = 0.9 * 999 = 899.1
        assert!((threshold - 899.1).abs() < 1e-9);
        assert_eq!(outliers.len(), 100);
        assert_eq!(
            outliers.len(),
            errors.iter().filter(|e| **e > threshold).count()
        );
    }

    #[test]
    fn test_strictly_greater() {
        let errors = vec![1.0, 1.0, 1.0, 1.0];
        let (threshold, outliers) = detector(75.0).threshold(&errors).unwrap();
        assert_eq!(threshold, 1.0);
        assert!(outliers.is_empty());
    }

    #[test]
    fn test_invalid_percentile() {
        let result = detector(120.0).threshold(&[1.0, 2.0]);
        assert!(matches!(result, Err(OutlierError::InvalidPercentile(_))));
    }

    #[test]
    fn test_no_finite_errors() {
        let result = detector(75.0).threshold(&[f64::NAN]);
        assert!(matches!(result, Err(OutlierError::NoFiniteErrors)));
    }

    #[test]
    fn test_split_partitions_rows() {
        let errors = vec![0.1, 0.2, 5.0, 0.3, 0.4, 0.2, 0.1, 9.0];
        let split = detector(75.0).split(&errors, &latents(8)).unwrap();

        assert_eq!(split.outliers, vec![2, 7]);
        assert_eq!(split.inliers, vec![0, 1, 3, 4, 5, 6]);
        assert!(split.dropped.is_empty());
        assert!(!split.degraded);
    }

    #[test]
    fn test_split_drops_nan_latents_below_limit() {
        let n = 100;
        let mut data: Vec<f32> = (0..n * 2).map(|v| v as f32 * 0.01).collect();
        data[2 * 10] = f32::NAN;
        let latents = Matrix::new(data, 2).unwrap();
        let mut errors: Vec<f64> = (0..n).map(|i| i as f64).collect();
        errors[10] = f64::NAN;

        let split = detector(75.0).split(&errors, &latents).unwrap();
        assert_eq!(split.dropped, vec![10]);
        assert!(!split.inliers.contains(&10));
        assert!(!split.outliers.contains(&10));
        assert!(!split.degraded);
        assert_eq!(split.inliers.len() + split.outliers.len() + split.dropped.len(), n);
    }

    #[test]
    fn test_split_flags_degraded_at_limit() {
        let n = 20;
        let mut data: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        // 1 of 20 rows = exactly 5%
        data[0] = f32::NAN;
        let latents = Matrix::new(data, 2).unwrap();
        let errors: Vec<f64> = (0..n).map(|i| i as f64).collect();

        let split = detector(75.0).split(&errors, &latents).unwrap();
        assert_eq!(split.dropped, vec![0]);
        assert!(split.degraded);
        assert!((split.nan_fraction - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_split_length_mismatch() {
        let result = detector(75.0).split(&[1.0, 2.0], &latents(3));
        assert!(matches!(
            result,
            Err(OutlierError::LengthMismatch { errors: 2, rows: 3 })
        ));
    }
}
