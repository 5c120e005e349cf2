//! Configuration types for the artifact labeling pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column layout of the detection table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Feature columns, in the fixed order the encoder consumes them
    #[serde(default = "default_feature_columns")]
    pub feature_columns: Vec<String>,

    /// Broad source class of each detection
    #[serde(default = "default_class_column")]
    pub class_column: String,

    /// Position columns used for plotting (x, y)
    #[serde(default = "default_position_columns")]
    pub position_columns: [String; 2],

    /// Output column holding the refined artifact label
    #[serde(default = "default_refined_column")]
    pub refined_column: String,
}

fn default_feature_columns() -> Vec<String> {
    [
        "snr",
        "rcs",
        "power",
        "noise_floor",
        "range_rate",
        "range_residual",
        "doppler_spread",
        "peak_width",
        "azimuth",
        "elevation",
        "azimuth_residual",
        "elevation_residual",
        "angle_spread",
        "beam_offset",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_class_column() -> String {
    "class".to_string()
}

fn default_position_columns() -> [String; 2] {
    ["x".to_string(), "y".to_string()]
}

fn default_refined_column() -> String {
    "refined_label".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            feature_columns: default_feature_columns(),
            class_column: default_class_column(),
            position_columns: default_position_columns(),
            refined_column: default_refined_column(),
        }
    }
}

/// Hyperparameters for the variational auto-encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Dimension of the latent code
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Width of both hidden layers in encoder and decoder
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Seed for weight init, reparameterization noise and batch shuffling
    #[serde(default = "default_encoder_seed")]
    pub seed: u64,

    /// Use an accelerator when one is compiled in and present
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,
}

fn default_latent_dim() -> usize {
    3
}

fn default_hidden_dim() -> usize {
    64
}

fn default_batch_size() -> usize {
    64
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_epochs() -> usize {
    50
}

fn default_encoder_seed() -> u64 {
    42
}

fn default_use_gpu() -> bool {
    true
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            latent_dim: default_latent_dim(),
            hidden_dim: default_hidden_dim(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
            seed: default_encoder_seed(),
            use_gpu: default_use_gpu(),
        }
    }
}

/// Configuration for reconstruction-error outlier detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierConfig {
    /// Percentile of the reconstruction error used as threshold (0-100)
    #[serde(default = "default_percentile")]
    pub percentile: f64,

    /// Fraction of NaN rows at which a run is considered degraded
    #[serde(default = "default_nan_fraction_limit")]
    pub nan_fraction_limit: f64,
}

fn default_percentile() -> f64 {
    75.0
}

fn default_nan_fraction_limit() -> f64 {
    0.05
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            nan_fraction_limit: default_nan_fraction_limit(),
        }
    }
}

/// Configuration for the truncated Dirichlet-process Gaussian mixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Upper bound on mixture components
    #[serde(default = "default_truncation")]
    pub truncation: usize,

    /// Weight concentration prior; `None` means 1 / truncation
    #[serde(default)]
    pub concentration: Option<f64>,

    /// Number of fit attempts before settling for the last fitted state
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Lower-bound change below which a fit counts as converged
    #[serde(default = "default_tol")]
    pub tol: f64,

    /// Non-negative regularization added to covariance diagonals
    #[serde(default = "default_reg_covar")]
    pub reg_covar: f64,

    /// Fraction of NaN rows tolerated in the clustering input
    #[serde(default = "default_nan_fraction_limit")]
    pub nan_fraction_limit: f64,

    #[serde(default = "default_clustering_seed")]
    pub seed: u64,
}

fn default_truncation() -> usize {
    9
}

fn default_max_retries() -> usize {
    3
}

fn default_tol() -> f64 {
    1e-3
}

fn default_reg_covar() -> f64 {
    1e-6
}

fn default_clustering_seed() -> u64 {
    7
}

impl ClusteringConfig {
    /// Concentration prior actually used by the fit.
    pub fn effective_concentration(&self) -> f64 {
        self.concentration
            .unwrap_or(1.0 / self.truncation.max(1) as f64)
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            truncation: default_truncation(),
            concentration: None,
            max_retries: default_max_retries(),
            tol: default_tol(),
            reg_covar: default_reg_covar(),
            nan_fraction_limit: default_nan_fraction_limit(),
            seed: default_clustering_seed(),
        }
    }
}

/// Configuration for artifact labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    /// Source classes whose members receive a refined artifact label
    #[serde(default = "default_refinable_classes")]
    pub refinable_classes: Vec<String>,

    /// Floor applied to global standard deviations
    #[serde(default = "default_std_floor")]
    pub std_floor: f64,
}

fn default_refinable_classes() -> Vec<String> {
    vec!["clutter".to_string(), "ghost".to_string()]
}

fn default_std_floor() -> f64 {
    1e-8
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            refinable_classes: default_refinable_classes(),
            std_floor: default_std_floor(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub outliers: OutlierConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub labeling: LabelingConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
