//! Variational auto-encoder producing latent codes and reconstruction errors.
//!
//! The encoder maps a feature vector through two ReLU hidden layers to a mean
//! and log-variance of dimension `latent_dim`; the decoder maps a latent
//! vector back through two ReLU hidden layers to a reconstruction.
//!
//! Weights live on the host between calls. `train` and `encode` each bind
//! them to the compute device for the duration of the call and release them
//! afterwards, so tensors from different devices are never mixed.
//!
//! All randomness (weight init, reparameterization noise, batch shuffling)
//! comes from a seedable `ChaCha8Rng` owned by [`LatentEncoder`]. The
//! [`TrainedEncoder`] returned by training owns no randomness at all, so
//! encoding is deterministic by construction.

use candle_core::{Device, Module, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::Linear;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::config::EncoderConfig;
use crate::core::transforms::{Matrix, MatrixError};

/// Errors that can occur while training or running the auto-encoder.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("no detections to train on or encode")]
    EmptyInput,

    #[error("feature dimension mismatch: model expects {expected}, input has {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("malformed encoder output: {0}")]
    Matrix(#[from] MatrixError),
}

/// Result type for encoder operations.
pub type Result<T> = std::result::Result<T, EncoderError>;

// Layer order inside `HostWeights` / `DeviceNetwork`
const ENC_1: usize = 0;
const ENC_2: usize = 1;
const MEAN: usize = 2;
const LOG_VAR: usize = 3;
const DEC_1: usize = 4;
const DEC_2: usize = 5;
const OUTPUT: usize = 6;

/// Pick the compute device for training and inference.
///
/// CUDA or Metal is used only when the corresponding cargo feature is enabled
/// and a device can actually be opened; everything else falls back to CPU.
pub fn select_device(use_gpu: bool) -> Device {
    if use_gpu {
        #[cfg(feature = "cuda")]
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(e) => log::warn!("CUDA requested but unavailable ({}), using CPU", e),
        }
        #[cfg(feature = "metal")]
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(e) => log::warn!("Metal requested but unavailable ({}), using CPU", e),
        }
    }
    Device::Cpu
}

/// Weight and bias of one dense layer, resident on the host.
#[derive(Debug, Clone)]
struct HostLayer {
    weight: Tensor,
    bias: Tensor,
}

/// All VAE parameters, resident on the host.
#[derive(Debug, Clone)]
struct HostWeights {
    layers: Vec<HostLayer>,
}

impl HostWeights {
    /// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)) init for weights and biases.
    fn init(input_dim: usize, hidden: usize, latent: usize, rng: &mut ChaCha8Rng) -> Result<Self> {
        let shapes = [
            (input_dim, hidden), // ENC_1
            (hidden, hidden),    // ENC_2
            (hidden, latent),    // MEAN
            (hidden, latent),    // LOG_VAR
            (latent, hidden),    // DEC_1
            (hidden, hidden),    // DEC_2
            (hidden, input_dim), // OUTPUT
        ];

        let mut layers = Vec::with_capacity(shapes.len());
        for (fan_in, fan_out) in shapes {
            let bound = 1.0 / (fan_in as f32).sqrt();
            let weight: Vec<f32> = (0..fan_in * fan_out)
                .map(|_| rng.random_range(-bound..bound))
                .collect();
            let bias: Vec<f32> = (0..fan_out).map(|_| rng.random_range(-bound..bound)).collect();
            layers.push(HostLayer {
                weight: Tensor::from_vec(weight, (fan_out, fan_in), &Device::Cpu)?,
                bias: Tensor::from_vec(bias, fan_out, &Device::Cpu)?,
            });
        }
        Ok(Self { layers })
    }
}

/// Copy a tensor into a fresh host tensor with no autograd history.
fn to_host(tensor: &Tensor) -> Result<Tensor> {
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    Ok(Tensor::from_vec(values, tensor.shape().clone(), &Device::Cpu)?)
}

/// VAE bound to a compute device for the duration of one call.
struct DeviceNetwork {
    layers: Vec<Linear>,
    /// Trainable handles, empty for inference sessions.
    vars: Vec<Var>,
    device: Device,
}

impl DeviceNetwork {
    /// Upload host weights to `device`.
    ///
    /// Trainable sessions wrap every parameter in a `Var` so the optimizer
    /// can update it in place.
    fn bind(host: &HostWeights, device: &Device, trainable: bool) -> Result<Self> {
        let mut layers = Vec::with_capacity(host.layers.len());
        let mut vars = Vec::new();

        for layer in &host.layers {
            let weight = layer.weight.to_device(device)?;
            let bias = layer.bias.to_device(device)?;
            let (weight, bias) = if trainable {
                let w = Var::from_tensor(&weight)?;
                let b = Var::from_tensor(&bias)?;
                let pair = (w.as_tensor().clone(), b.as_tensor().clone());
                vars.push(w);
                vars.push(b);
                pair
            } else {
                (weight, bias)
            };
            layers.push(Linear::new(weight, Some(bias)));
        }

        log::debug!("bound auto-encoder to {:?} (trainable={})", device, trainable);
        Ok(Self {
            layers,
            vars,
            device: device.clone(),
        })
    }

    /// Download the current parameters to the host and drop device state.
    fn release(self) -> Result<HostWeights> {
        let mut layers = Vec::with_capacity(self.layers.len());
        for linear in &self.layers {
            let bias = linear
                .bias()
                .ok_or_else(|| EncoderError::InvalidHyperparameter("layer without bias".into()))?;
            layers.push(HostLayer {
                weight: to_host(linear.weight())?,
                bias: to_host(bias)?,
            });
        }
        log::debug!("released auto-encoder from {:?}", self.device);
        Ok(HostWeights { layers })
    }

    fn posterior(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = self.layers[ENC_1].forward(x)?.relu()?;
        let h = self.layers[ENC_2].forward(&h)?.relu()?;
        let mean = self.layers[MEAN].forward(&h)?;
        let log_var = self.layers[LOG_VAR].forward(&h)?;
        Ok((mean, log_var))
    }

    fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.layers[DEC_1].forward(z)?.relu()?;
        let h = self.layers[DEC_2].forward(&h)?.relu()?;
        Ok(self.layers[OUTPUT].forward(&h)?)
    }
}

/// Upload the given rows of `features` as a (rows, cols) tensor.
fn batch_tensor(features: &Matrix, indices: &[usize], device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(indices.len() * features.n_cols());
    for &i in indices {
        data.extend_from_slice(features.row(i));
    }
    Ok(Tensor::from_vec(data, (indices.len(), features.n_cols()), device)?)
}

/// Summed squared reconstruction error plus closed-form KL to N(0, I).
///
/// Neither term is normalized by the batch size.
fn vae_loss(x: &Tensor, recon: &Tensor, mean: &Tensor, log_var: &Tensor) -> Result<Tensor> {
    let recon_loss = (recon - x)?.sqr()?.sum_all()?;
    let kl_terms = ((log_var + 1.0)? - mean.sqr()?)?.sub(&log_var.exp()?)?;
    let kl = (kl_terms.sum_all()? * -0.5)?;
    Ok((recon_loss + kl)?)
}

/// Untrained auto-encoder plus its randomness source.
pub struct LatentEncoder {
    config: EncoderConfig,
    input_dim: usize,
    device: Device,
    rng: ChaCha8Rng,
}

impl LatentEncoder {
    /// Create an encoder seeded from `config.seed`.
    pub fn new(input_dim: usize, config: &EncoderConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self::with_rng(input_dim, config, rng)
    }

    /// Create an encoder drawing all randomness from `rng`.
    pub fn with_rng(input_dim: usize, config: &EncoderConfig, rng: ChaCha8Rng) -> Self {
        Self {
            config: config.clone(),
            input_dim,
            device: select_device(config.use_gpu),
            rng,
        }
    }

    /// Override the compute device picked from the configuration.
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn validate(&self, features: &Matrix) -> Result<()> {
        let cfg = &self.config;
        if cfg.latent_dim == 0 || cfg.hidden_dim == 0 || cfg.batch_size == 0 {
            return Err(EncoderError::InvalidHyperparameter(format!(
                "latent_dim={}, hidden_dim={}, batch_size={} must all be positive",
                cfg.latent_dim, cfg.hidden_dim, cfg.batch_size
            )));
        }
        if !(cfg.learning_rate > 0.0) {
            return Err(EncoderError::InvalidHyperparameter(format!(
                "learning_rate={} must be positive",
                cfg.learning_rate
            )));
        }
        if features.is_empty() {
            return Err(EncoderError::EmptyInput);
        }
        if features.n_cols() != self.input_dim {
            return Err(EncoderError::DimensionMismatch {
                expected: self.input_dim,
                found: features.n_cols(),
            });
        }
        Ok(())
    }

    /// Train on `features` and return the trained state.
    ///
    /// Each epoch shuffles the rows, then for every minibatch draws one latent
    /// sample per detection as `mean + noise * exp(0.5 * log_var)` and takes
    /// an Adam step on the VAE loss.
    pub fn train(mut self, features: &Matrix) -> Result<TrainedEncoder> {
        self.validate(features)?;
        let cfg = self.config.clone();

        let host = HostWeights::init(self.input_dim, cfg.hidden_dim, cfg.latent_dim, &mut self.rng)?;
        let network = DeviceNetwork::bind(&host, &self.device, true)?;

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(network.vars.clone(), params)?;

        let pb = ProgressBar::new(cfg.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );

        let n = features.n_rows();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut epoch_losses = Vec::with_capacity(cfg.epochs);
        let mut warned_non_finite = false;

        for epoch in 0..cfg.epochs {
            indices.shuffle(&mut self.rng);
            let mut total = 0.0f64;

            for batch in indices.chunks(cfg.batch_size) {
                let x = batch_tensor(features, batch, &self.device)?;
                let (mean, log_var) = network.posterior(&x)?;

                let noise: Vec<f32> = (0..batch.len() * cfg.latent_dim)
                    .map(|_| self.rng.sample::<f32, _>(StandardNormal))
                    .collect();
                let noise = Tensor::from_vec(noise, (batch.len(), cfg.latent_dim), &self.device)?;
                let std = (&log_var * 0.5)?.exp()?;
                let z = (&mean + noise.mul(&std)?)?;

                let recon = network.decode(&z)?;
                let loss = vae_loss(&x, &recon, &mean, &log_var)?;
                optimizer.backward_step(&loss)?;

                total += loss.to_scalar::<f32>()? as f64;
            }

            let epoch_loss = total / n as f64;
            if !epoch_loss.is_finite() && !warned_non_finite {
                log::warn!("epoch {}: non-finite training loss", epoch + 1);
                warned_non_finite = true;
            }
            log::debug!("epoch {}/{} loss {:.4}", epoch + 1, cfg.epochs, epoch_loss);
            pb.set_message(format!("{:.4}", epoch_loss));
            pb.inc(1);
            epoch_losses.push(epoch_loss);
        }
        pb.finish_and_clear();

        if let Some(last) = epoch_losses.last() {
            log::info!("trained auto-encoder for {} epochs, final loss {:.4}", cfg.epochs, last);
        }

        let weights = network.release()?;
        Ok(TrainedEncoder {
            weights,
            device: self.device,
            input_dim: self.input_dim,
            latent_dim: cfg.latent_dim,
            batch_size: cfg.batch_size,
            epoch_losses,
        })
    }
}

/// Latent codes and reconstruction errors for a set of detections.
#[derive(Debug, Clone)]
pub struct Encoding {
    /// Mean of the latent posterior, one row per detection, in input order.
    pub latent_means: Matrix,
    /// Log-variance of the latent posterior, aligned with `latent_means`.
    pub latent_log_vars: Matrix,
    /// Mean squared error between each input row and the decoded mean.
    pub reconstruction_errors: Vec<f64>,
}

/// Auto-encoder with fixed trained weights.
#[derive(Debug, Clone)]
pub struct TrainedEncoder {
    weights: HostWeights,
    device: Device,
    input_dim: usize,
    latent_dim: usize,
    batch_size: usize,
    epoch_losses: Vec<f64>,
}

impl TrainedEncoder {
    /// Average per-detection loss of every training epoch.
    pub fn epoch_losses(&self) -> &[f64] {
        &self.epoch_losses
    }

    /// Encode `features` in input order.
    ///
    /// Uses the posterior mean as the latent code and reconstructs from it;
    /// no sampling happens on this path.
    pub fn encode(&self, features: &Matrix) -> Result<Encoding> {
        if features.is_empty() {
            return Err(EncoderError::EmptyInput);
        }
        if features.n_cols() != self.input_dim {
            return Err(EncoderError::DimensionMismatch {
                expected: self.input_dim,
                found: features.n_cols(),
            });
        }

        let network = DeviceNetwork::bind(&self.weights, &self.device, false)?;
        let n = features.n_rows();
        let mut means = Vec::with_capacity(n * self.latent_dim);
        let mut log_vars = Vec::with_capacity(n * self.latent_dim);
        let mut errors = Vec::with_capacity(n);

        let indices: Vec<usize> = (0..n).collect();
        for batch in indices.chunks(self.batch_size.max(1)) {
            let x = batch_tensor(features, batch, &self.device)?;
            let (mean, log_var) = network.posterior(&x)?;
            let recon = network.decode(&mean)?;
            let err = (&recon - &x)?.sqr()?.mean(1)?;

            means.extend(mean.flatten_all()?.to_vec1::<f32>()?);
            log_vars.extend(log_var.flatten_all()?.to_vec1::<f32>()?);
            errors.extend(err.to_vec1::<f32>()?.into_iter().map(f64::from));
        }
        drop(network);

        Ok(Encoding {
            latent_means: Matrix::new(means, self.latent_dim)?,
            latent_log_vars: Matrix::new(log_vars, self.latent_dim)?,
            reconstruction_errors: errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_features(n: usize, dim: usize, seed: u64) -> Matrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n * dim)
            .map(|i| {
                let centre = if (i / dim) % 2 == 0 { -1.0 } else { 1.0 };
                centre + 0.1 * rng.sample::<f32, _>(StandardNormal)
            })
            .collect();
        Matrix::new(data, dim).unwrap()
    }

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            latent_dim: 2,
            hidden_dim: 8,
            batch_size: 16,
            learning_rate: 1e-2,
            epochs: 5,
            seed: 3,
            use_gpu: false,
        }
    }

    #[test]
    fn test_encode_shapes() {
        let features = toy_features(40, 4, 1);
        let trained = LatentEncoder::new(4, &small_config()).train(&features).unwrap();

        let encoding = trained.encode(&features).unwrap();
        assert_eq!(encoding.latent_means.n_rows(), 40);
        assert_eq!(encoding.latent_means.n_cols(), 2);
        assert_eq!(encoding.latent_log_vars.n_rows(), 40);
        assert_eq!(encoding.reconstruction_errors.len(), 40);
        assert!(encoding.reconstruction_errors.iter().all(|e| *e >= 0.0));
        assert_eq!(trained.epoch_losses().len(), 5);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let features = toy_features(33, 3, 2);
        let trained = LatentEncoder::new(3, &small_config()).train(&features).unwrap();

        let first = trained.encode(&features).unwrap();
        let second = trained.encode(&features).unwrap();
        assert_eq!(first.latent_means, second.latent_means);
        assert_eq!(first.reconstruction_errors, second.reconstruction_errors);
    }

    #[test]
    fn test_encode_preserves_row_order() {
        let features = toy_features(20, 3, 4);
        let trained = LatentEncoder::new(3, &small_config()).train(&features).unwrap();

        let full = trained.encode(&features).unwrap();
        let single = trained.encode(&features.select_rows(&[7])).unwrap();
        for (a, b) in full.latent_means.row(7).iter().zip(single.latent_means.row(0)) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_training_is_reproducible_from_seed() {
        let features = toy_features(30, 4, 5);
        let a = LatentEncoder::new(4, &small_config()).train(&features).unwrap();
        let b = LatentEncoder::new(4, &small_config()).train(&features).unwrap();

        let ea = a.encode(&features).unwrap();
        let eb = b.encode(&features).unwrap();
        for (x, y) in ea.latent_means.as_slice().iter().zip(eb.latent_means.as_slice()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let features = toy_features(64, 4, 6);
        let config = EncoderConfig {
            epochs: 30,
            ..small_config()
        };
        let trained = LatentEncoder::new(4, &config).train(&features).unwrap();

        let losses = trained.epoch_losses();
        assert!(losses.last().unwrap() < losses.first().unwrap());
    }

    #[test]
    fn test_dimension_mismatch() {
        let features = toy_features(10, 4, 7);
        let trained = LatentEncoder::new(4, &small_config()).train(&features).unwrap();

        let other = toy_features(10, 3, 7);
        assert!(matches!(
            trained.encode(&other),
            Err(EncoderError::DimensionMismatch { expected: 4, found: 3 })
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        let result = LatentEncoder::new(3, &small_config()).train(&Matrix::empty(3));
        assert!(matches!(result, Err(EncoderError::EmptyInput)));
    }

    #[test]
    fn test_invalid_hyperparameters() {
        let features = toy_features(10, 3, 8);
        let config = EncoderConfig {
            latent_dim: 0,
            ..small_config()
        };
        let result = LatentEncoder::new(3, &config).train(&features);
        assert!(matches!(result, Err(EncoderError::InvalidHyperparameter(_))));
    }
}
