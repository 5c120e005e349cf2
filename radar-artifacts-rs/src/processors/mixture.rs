//! Truncated Dirichlet-process Gaussian mixture fitted by variational inference.
//!
//! The model uses a stick-breaking weight prior with a fixed truncation
//! level, a Gaussian-Wishart prior on each component's mean and full
//! precision matrix, and coordinate-ascent updates of the variational
//! posterior until the evidence lower bound stops improving. Components the
//! data does not need keep negligible weight, so the fitted mixture usually
//! populates fewer components than the truncation level.
//!
//! A fit never emits side-channel warnings: convergence is reported through
//! [`FitResult::converged`] and [`FitResult::diagnostics`].

use std::f64::consts::{LN_2, PI};

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use statrs::function::gamma::{digamma, ln_gamma};
use thiserror::Error;

use crate::core::transforms::Matrix;

/// Errors that can occur while fitting the mixture.
#[derive(Error, Debug)]
pub enum MixtureError {
    #[error("input contains {} rows with non-finite values", .rows.len())]
    NonFiniteInput { rows: Vec<usize> },

    #[error("no samples to fit")]
    EmptyInput,

    #[error("covariance of component {component} is not positive definite; increase reg_covar")]
    NotPositiveDefinite { component: usize },

    #[error("invalid mixture parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for mixture operations.
pub type Result<T> = std::result::Result<T, MixtureError>;

/// How initial responsibilities are seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStrategy {
    /// Hard assignments from a k-means++ seeded Lloyd run.
    KMeans,
    /// Uniform random responsibilities, normalized per row.
    Random,
}

/// Settings for a single fit.
#[derive(Debug, Clone)]
pub struct MixtureParams {
    /// Truncation level (maximum number of components).
    pub n_components: usize,
    /// Stick-breaking concentration prior.
    pub concentration: f64,
    pub tol: f64,
    pub reg_covar: f64,
    pub max_iter: usize,
    pub init: InitStrategy,
    pub seed: u64,
}

/// Variational posterior of a fitted mixture.
#[derive(Debug, Clone)]
pub struct MixtureState {
    /// Beta posterior parameters of each stick-breaking fraction.
    concentration_a: Vec<f64>,
    concentration_b: Vec<f64>,
    mean_precision: Vec<f64>,
    means: Vec<DVector<f64>>,
    degrees_of_freedom: Vec<f64>,
    precisions_cholesky: Vec<DMatrix<f64>>,
}

/// Outcome of one fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub state: MixtureState,
    /// Lower-bound change fell below `tol` within `max_iter` iterations.
    pub converged: bool,
    pub n_iter: usize,
    pub lower_bound: f64,
    pub diagnostics: Vec<String>,
}

/// Prior hyperparameters derived from the data.
struct Priors {
    concentration: f64,
    mean_precision: f64,
    mean: DVector<f64>,
    degrees_of_freedom: f64,
    covariance: DMatrix<f64>,
}

impl Priors {
    fn from_data(x: &DMatrix<f64>, concentration: f64) -> Self {
        let (n, d) = x.shape();
        let mean = DVector::from_fn(d, |j, _| x.column(j).sum() / n as f64);

        let covariance = if n > 1 {
            let mut cov = DMatrix::zeros(d, d);
            for i in 0..n {
                let diff = x.row(i).transpose() - &mean;
                cov += &diff * diff.transpose();
            }
            cov / (n - 1) as f64
        } else {
            DMatrix::identity(d, d)
        };

        Self {
            concentration,
            mean_precision: 1.0,
            mean,
            degrees_of_freedom: d as f64,
            covariance,
        }
    }
}

/// Convert a row-major `Matrix` into an (n, d) `DMatrix<f64>`.
pub fn to_dmatrix(m: &Matrix) -> DMatrix<f64> {
    DMatrix::from_fn(m.n_rows(), m.n_cols(), |i, j| m.row(i)[j] as f64)
}

/// Rows of `x` containing a NaN or infinite value.
pub fn non_finite_rows(x: &DMatrix<f64>) -> Vec<usize> {
    (0..x.nrows())
        .filter(|&i| x.row(i).iter().any(|v| !v.is_finite()))
        .collect()
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Inverse-transposed Cholesky factor of `cov`, i.e. `L^{-T}` with `cov = L L^T`.
fn precision_cholesky(cov: &DMatrix<f64>, component: usize) -> Result<DMatrix<f64>> {
    let d = cov.nrows();
    let chol = cov
        .clone()
        .cholesky()
        .ok_or(MixtureError::NotPositiveDefinite { component })?;
    let inv_l = chol
        .l()
        .solve_lower_triangular(&DMatrix::identity(d, d))
        .ok_or(MixtureError::NotPositiveDefinite { component })?;
    Ok(inv_l.transpose())
}

fn log_det_cholesky(prec_chol: &DMatrix<f64>) -> f64 {
    prec_chol.diagonal().iter().map(|v| v.ln()).sum()
}

/// Sufficient statistics: soft counts, weighted means and covariances.
fn gaussian_statistics(
    x: &DMatrix<f64>,
    resp: &DMatrix<f64>,
    reg_covar: f64,
) -> (Vec<f64>, Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
    let (n, d) = x.shape();
    let k = resp.ncols();

    let stats: Vec<(f64, DVector<f64>, DMatrix<f64>)> = (0..k)
        .into_par_iter()
        .map(|c| {
            let nk = resp.column(c).sum() + 10.0 * f64::EPSILON;
            let mut mean = DVector::zeros(d);
            for i in 0..n {
                mean += x.row(i).transpose() * resp[(i, c)];
            }
            mean /= nk;

            let mut cov = DMatrix::zeros(d, d);
            for i in 0..n {
                let diff = x.row(i).transpose() - &mean;
                cov += (&diff * diff.transpose()) * resp[(i, c)];
            }
            cov /= nk;
            for j in 0..d {
                cov[(j, j)] += reg_covar;
            }
            (nk, mean, cov)
        })
        .collect();

    let mut nk = Vec::with_capacity(k);
    let mut means = Vec::with_capacity(k);
    let mut covs = Vec::with_capacity(k);
    for (count, mean, cov) in stats {
        nk.push(count);
        means.push(mean);
        covs.push(cov);
    }
    (nk, means, covs)
}

impl MixtureState {
    /// Variational M-step from responsibilities.
    fn from_responsibilities(
        x: &DMatrix<f64>,
        resp: &DMatrix<f64>,
        priors: &Priors,
        reg_covar: f64,
    ) -> Result<Self> {
        let (nk, xk, sk) = gaussian_statistics(x, resp, reg_covar);
        let k = nk.len();
        let d = x.ncols();

        let concentration_a: Vec<f64> = nk.iter().map(|n| 1.0 + n).collect();
        let mut concentration_b = vec![priors.concentration; k];
        let mut tail = 0.0;
        for c in (0..k).rev() {
            concentration_b[c] += tail;
            tail += nk[c];
        }

        let mean_precision: Vec<f64> = nk.iter().map(|n| priors.mean_precision + n).collect();
        let means: Vec<DVector<f64>> = (0..k)
            .map(|c| (&priors.mean * priors.mean_precision + &xk[c] * nk[c]) / mean_precision[c])
            .collect();

        let degrees_of_freedom: Vec<f64> =
            nk.iter().map(|n| priors.degrees_of_freedom + n).collect();

        let mut precisions_cholesky = Vec::with_capacity(k);
        for c in 0..k {
            let diff = &xk[c] - &priors.mean;
            let shrink = nk[c] * priors.mean_precision / mean_precision[c];
            let cov = (&priors.covariance + &sk[c] * nk[c] + (&diff * diff.transpose()) * shrink)
                / degrees_of_freedom[c];
            debug_assert_eq!(cov.nrows(), d);
            precisions_cholesky.push(precision_cholesky(&cov, c)?);
        }

        Ok(Self {
            concentration_a,
            concentration_b,
            mean_precision,
            means,
            degrees_of_freedom,
            precisions_cholesky,
        })
    }

    /// Number of components (the truncation level actually used).
    pub fn n_components(&self) -> usize {
        self.means.len()
    }

    /// Expected mixture weights under the stick-breaking posterior.
    pub fn weights(&self) -> Vec<f64> {
        let mut remaining = 1.0;
        let mut weights = Vec::with_capacity(self.n_components());
        for (a, b) in self.concentration_a.iter().zip(&self.concentration_b) {
            let frac = a / (a + b);
            weights.push(remaining * frac);
            remaining *= b / (a + b);
        }
        weights
    }

    fn log_weights(&self) -> Vec<f64> {
        let mut offset = 0.0;
        let mut out = Vec::with_capacity(self.n_components());
        for (a, b) in self.concentration_a.iter().zip(&self.concentration_b) {
            let digamma_sum = digamma(a + b);
            out.push(digamma(*a) - digamma_sum + offset);
            offset += digamma(*b) - digamma_sum;
        }
        out
    }

    /// Expected log density plus expected log weight, (n, k).
    fn weighted_log_prob(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let (n, d) = x.shape();
        let df = d as f64;
        let log_weights = self.log_weights();

        let columns: Vec<Vec<f64>> = (0..self.n_components())
            .into_par_iter()
            .map(|c| {
                let prec_chol = &self.precisions_cholesky[c];
                let dof = self.degrees_of_freedom[c];
                let log_det = log_det_cholesky(prec_chol);
                let log_lambda = df * LN_2
                    + (0..d)
                        .map(|i| digamma(0.5 * (dof - i as f64)))
                        .sum::<f64>();
                let offset = log_det - 0.5 * df * dof.ln()
                    + 0.5 * (log_lambda - df / self.mean_precision[c])
                    + log_weights[c]
                    - 0.5 * df * (2.0 * PI).ln();

                (0..n)
                    .map(|i| {
                        let diff = x.row(i) - self.means[c].transpose();
                        let y = diff * prec_chol;
                        offset - 0.5 * y.norm_squared()
                    })
                    .collect()
            })
            .collect();

        DMatrix::from_fn(n, self.n_components(), |i, c| columns[c][i])
    }

    /// E-step: mean log normalizer and log responsibilities.
    fn log_responsibilities(&self, x: &DMatrix<f64>) -> (f64, DMatrix<f64>) {
        let mut weighted = self.weighted_log_prob(x);
        let n = weighted.nrows();
        let mut total = 0.0;
        for i in 0..n {
            let row: Vec<f64> = weighted.row(i).iter().copied().collect();
            let norm = log_sum_exp(&row);
            total += norm;
            for v in weighted.row_mut(i).iter_mut() {
                *v -= norm;
            }
        }
        (total / n.max(1) as f64, weighted)
    }

    /// Evidence lower bound for the current posterior.
    fn lower_bound(&self, log_resp: &DMatrix<f64>, d: usize) -> f64 {
        let df = d as f64;

        let entropy: f64 = log_resp
            .iter()
            .filter(|v| v.is_finite())
            .map(|v| v.exp() * v)
            .sum();

        let log_wishart: f64 = (0..self.n_components())
            .map(|c| {
                let dof = self.degrees_of_freedom[c];
                let log_det =
                    log_det_cholesky(&self.precisions_cholesky[c]) - 0.5 * df * dof.ln();
                let gamma_terms: f64 = (0..d).map(|i| ln_gamma(0.5 * (dof - i as f64))).sum();
                -(dof * log_det + dof * df * 0.5 * LN_2 + gamma_terms)
            })
            .sum();

        let log_norm_weight: f64 = -self
            .concentration_a
            .iter()
            .zip(&self.concentration_b)
            .map(|(a, b)| ln_gamma(*a) + ln_gamma(*b) - ln_gamma(a + b))
            .sum::<f64>();

        let precision_term: f64 = self.mean_precision.iter().map(|p| p.ln()).sum();

        -entropy - log_wishart - log_norm_weight - 0.5 * df * precision_term
    }

    /// Most probable component for every row of `x`.
    pub fn predict(&self, x: &DMatrix<f64>) -> Vec<usize> {
        let weighted = self.weighted_log_prob(x);
        (0..weighted.nrows())
            .map(|i| {
                weighted
                    .row(i)
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (c, &v)| {
                        if v > best.1 {
                            (c, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Squared Euclidean distance between row `i` of `x` and `centre`.
fn distance_sq(x: &DMatrix<f64>, i: usize, centre: &DVector<f64>) -> f64 {
    x.row(i)
        .iter()
        .zip(centre.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum()
}

fn nearest(x: &DMatrix<f64>, i: usize, centres: &[DVector<f64>]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, centre) in centres.iter().enumerate() {
        let dist = distance_sq(x, i, centre);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// One-hot responsibilities from k-means++ seeding followed by Lloyd iterations.
fn kmeans_responsibilities(x: &DMatrix<f64>, k: usize, rng: &mut ChaCha8Rng) -> DMatrix<f64> {
    const LLOYD_ITERATIONS: usize = 100;
    let n = x.nrows();

    let mut centres: Vec<DVector<f64>> = Vec::with_capacity(k);
    centres.push(x.row(rng.random_range(0..n)).transpose());
    while centres.len() < k {
        let dists: Vec<f64> = (0..n)
            .map(|i| distance_sq(x, i, &centres[nearest(x, i, &centres)]))
            .collect();
        let total: f64 = dists.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.random::<f64>() * total;
            dists
                .iter()
                .position(|d| {
                    target -= d;
                    target <= 0.0
                })
                .unwrap_or(n - 1)
        } else {
            rng.random_range(0..n)
        };
        centres.push(x.row(pick).transpose());
    }

    let mut labels: Vec<usize> = (0..n).map(|i| nearest(x, i, &centres)).collect();
    for _ in 0..LLOYD_ITERATIONS {
        for (c, centre) in centres.iter_mut().enumerate() {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == c).collect();
            if members.is_empty() {
                continue;
            }
            let mut sum = DVector::zeros(x.ncols());
            for &i in &members {
                sum += x.row(i).transpose();
            }
            *centre = sum / members.len() as f64;
        }
        let next: Vec<usize> = (0..n).map(|i| nearest(x, i, &centres)).collect();
        if next == labels {
            break;
        }
        labels = next;
    }

    let mut resp = DMatrix::zeros(n, k);
    for (i, &c) in labels.iter().enumerate() {
        resp[(i, c)] = 1.0;
    }
    resp
}

fn random_responsibilities(n: usize, k: usize, rng: &mut ChaCha8Rng) -> DMatrix<f64> {
    let mut resp = DMatrix::from_fn(n, k, |_, _| rng.random::<f64>());
    for i in 0..n {
        let sum: f64 = resp.row(i).sum();
        for v in resp.row_mut(i).iter_mut() {
            *v /= sum;
        }
    }
    resp
}

/// Fit the mixture to the rows of `x`.
///
/// # Errors
///
/// `NonFiniteInput` if any row holds NaN/inf (listing those rows),
/// `EmptyInput` for zero rows, `NotPositiveDefinite` when a component
/// covariance cannot be factorized.
pub fn fit(x: &DMatrix<f64>, params: &MixtureParams) -> Result<FitResult> {
    if params.n_components == 0 || !(params.concentration > 0.0) || params.reg_covar < 0.0 {
        return Err(MixtureError::InvalidParameter(format!(
            "n_components={}, concentration={}, reg_covar={}",
            params.n_components, params.concentration, params.reg_covar
        )));
    }
    let (n, d) = x.shape();
    if n == 0 {
        return Err(MixtureError::EmptyInput);
    }
    let bad = non_finite_rows(x);
    if !bad.is_empty() {
        return Err(MixtureError::NonFiniteInput { rows: bad });
    }

    let k = params.n_components.min(n);
    let priors = Priors::from_data(x, params.concentration);
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);

    let resp = match params.init {
        InitStrategy::KMeans => kmeans_responsibilities(x, k, &mut rng),
        InitStrategy::Random => random_responsibilities(n, k, &mut rng),
    };
    let mut state = MixtureState::from_responsibilities(x, &resp, &priors, params.reg_covar)?;

    let mut lower_bound = f64::NEG_INFINITY;
    let mut converged = false;
    let mut change = f64::INFINITY;
    let mut n_iter = 0;

    for iter in 1..=params.max_iter {
        n_iter = iter;
        let previous = lower_bound;

        let (_, log_resp) = state.log_responsibilities(x);
        let resp = log_resp.map(f64::exp);
        state = MixtureState::from_responsibilities(x, &resp, &priors, params.reg_covar)?;

        lower_bound = state.lower_bound(&log_resp, d);
        change = lower_bound - previous;
        if change.abs() < params.tol {
            converged = true;
            break;
        }
    }

    let mut diagnostics = Vec::new();
    if !converged {
        diagnostics.push(format!(
            "{:?} init did not converge after {} iterations (lower bound change {:.3e}, tol {:.1e})",
            params.init, n_iter, change, params.tol
        ));
    }

    Ok(FitResult {
        state,
        converged,
        n_iter,
        lower_bound,
        diagnostics,
    })
}
