//! Numeric building blocks shared by the pipeline stages.
//!
//! This module provides:
//! - A dense row-major `Matrix` used for feature vectors and latent codes
//! - Global reference statistics (per-feature mean and floored std)
//! - Percentiles with linear interpolation between closest ranks
//! - NaN row detection and row filtering

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while assembling a matrix.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("row {row} has {found} values, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("buffer of {len} values is not divisible into rows of {cols}")]
    BadShape { len: usize, cols: usize },
}

/// Dense row-major matrix of `f32` values.
///
/// Row order is significant: row `i` always refers to detection `i` of the
/// table it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Wrap a row-major buffer.
    pub fn new(data: Vec<f32>, cols: usize) -> Result<Self, MatrixError> {
        if cols == 0 || data.len() % cols != 0 {
            return Err(MatrixError::BadShape {
                len: data.len(),
                cols,
            });
        }
        let rows = data.len() / cols;
        Ok(Self { data, rows, cols })
    }

    /// Build a matrix from nested rows, checking every row has the same width.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, MatrixError> {
        let cols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(MatrixError::RaggedRow {
                    row: i,
                    found: row.len(),
                    expected: cols,
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            rows: rows.len(),
            cols,
        })
    }

    /// An empty matrix with a fixed column count.
    pub fn empty(cols: usize) -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
            cols,
        }
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    /// Overwrite every cell of the given rows with `value`.
    pub fn fill_rows(&mut self, indices: &[usize], value: f32) {
        for &i in indices {
            self.data[i * self.cols..(i + 1) * self.cols].fill(value);
        }
    }

    /// Copy the given rows, in the given order, into a new matrix.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            data,
            rows: indices.len(),
            cols: self.cols,
        }
    }
}

/// Global per-feature reference statistics for a run.
///
/// Computed once over the full detection set and handed to the labeler as an
/// immutable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ReferenceStats {
    /// Compute population mean and standard deviation per column.
    ///
    /// Non-finite cells are skipped. Standard deviations are floored at
    /// `std_floor` so z-scores never divide by zero.
    pub fn compute(features: &Matrix, std_floor: f64) -> Self {
        let (mean, std): (Vec<f64>, Vec<f64>) = (0..features.n_cols())
            .into_par_iter()
            .map(|col| {
                let values: Vec<f64> = features
                    .rows()
                    .map(|r| r[col] as f64)
                    .filter(|v| v.is_finite())
                    .collect();
                if values.is_empty() {
                    return (0.0, std_floor);
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                (mean, var.sqrt().max(std_floor))
            })
            .unzip();
        Self { mean, std }
    }

    #[inline]
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }
}

/// Percentile of `values` (0-100) using linear interpolation between the
/// two closest ranks.
///
/// Returns `None` for an empty slice or a percentile outside [0, 100].
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Indices of rows containing at least one NaN component.
pub fn nan_rows(matrix: &Matrix) -> Vec<usize> {
    matrix
        .rows()
        .enumerate()
        .filter(|(_, r)| r.iter().any(|v| v.is_nan()))
        .map(|(i, _)| i)
        .collect()
}

/// Indices of rows containing a NaN or infinite component.
pub fn non_finite_rows(matrix: &Matrix) -> Vec<usize> {
    matrix
        .rows()
        .enumerate()
        .filter(|(_, r)| r.iter().any(|v| !v.is_finite()))
        .map(|(i, _)| i)
        .collect()
}

/// Fraction of `count` over `total`, 0 for an empty total.
#[inline]
pub fn fraction(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_from_rows() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(m.n_rows(), 3);
        assert_eq!(m.n_cols(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
        assert_eq!(m.rows().count(), 3);
    }

    #[test]
    fn test_matrix_ragged_rows_rejected() {
        let result = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]);
        match result {
            Err(MatrixError::RaggedRow { row, found, expected }) => {
                assert_eq!(row, 1);
                assert_eq!(found, 1);
                assert_eq!(expected, 2);
            }
            _ => panic!("Expected RaggedRow error"),
        }
    }

    #[test]
    fn test_matrix_bad_shape() {
        assert!(Matrix::new(vec![1.0, 2.0, 3.0], 2).is_err());
        assert!(Matrix::new(vec![1.0, 2.0], 0).is_err());
    }

    #[test]
    fn test_select_rows_keeps_order() {
        let m = Matrix::from_rows(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let s = m.select_rows(&[3, 1]);
        assert_eq!(s.as_slice(), &[3.0, 1.0]);
    }

    #[test]
    fn test_reference_stats() {
        let m = Matrix::from_rows(&[vec![1.0, 5.0], vec![3.0, 5.0]]).unwrap();
        let stats = ReferenceStats::compute(&m, 1e-8);
        assert_eq!(stats.mean, vec![2.0, 5.0]);
        assert!((stats.std[0] - 1.0).abs() < 1e-12);
        // Constant column is floored, not zero
        assert_eq!(stats.std[1], 1e-8);
    }

    #[test]
    fn test_reference_stats_skips_nan() {
        let m = Matrix::from_rows(&[vec![1.0], vec![f32::NAN], vec![3.0]]).unwrap();
        let stats = ReferenceStats::compute(&m, 1e-8);
        assert_eq!(stats.mean, vec![2.0]);
    }

    #[test]
    fn test_percentile_interpolation() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(4.0));
        assert_eq!(percentile(&values, 50.0), Some(2.5));
        // rank = 0.75 * 3 = 2.25 -> 3 + 0.25
        assert_eq!(percentile(&values, 75.0), Some(3.25));
    }

    #[test]
    fn test_percentile_unsorted_and_invalid() {
        let values = vec![10.0, 0.0, 5.0];
        assert_eq!(percentile(&values, 50.0), Some(5.0));
        assert_eq!(percentile(&values, 101.0), None);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_nan_rows() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![f32::NAN, 0.0], vec![0.0, f32::NAN]]).unwrap();
        assert_eq!(nan_rows(&m), vec![1, 2]);
        assert_eq!(fraction(2, 3), 2.0 / 3.0);
        assert_eq!(fraction(0, 0), 0.0);
    }

    #[test]
    fn test_non_finite_rows_include_infinity() {
        let m = Matrix::from_rows(&[
            vec![1.0, f32::INFINITY],
            vec![0.0, 0.0],
            vec![f32::NEG_INFINITY, 0.0],
            vec![f32::NAN, 0.0],
        ])
        .unwrap();
        assert_eq!(non_finite_rows(&m), vec![0, 2, 3]);
        assert_eq!(nan_rows(&m), vec![3]);
    }

    #[test]
    fn test_fill_rows() {
        let mut m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        m.fill_rows(&[0, 2], f32::NAN);
        assert!(m.row(0).iter().all(|v| v.is_nan()));
        assert_eq!(m.row(1), &[3.0, 4.0]);
        assert!(m.row(2).iter().all(|v| v.is_nan()));
    }
}
