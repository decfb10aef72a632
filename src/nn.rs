//! Components to build a neural network
//!
//! Every layer consumes a batch of rows, each row holding `in_features` values, and
//! produces one row of `out_features` values per input row. Randomness is never taken
//! from an ambient generator: initialization and weight sampling receive the RNG explicitly.

use std::{
    cell::RefCell,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, RngCore};
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use crate::values::Value;

/// Initial log-variance of every Bayesian weight, small enough that a fresh layer
/// behaves almost like a deterministic one
pub const DEFAULT_INIT_LOGVAR: f32 = -9.0;

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Input size mismatch, expected {expected} features but got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
///
/// Only `parameters`, `forward` and `reset` are required; deterministic modules have no
/// KL contribution and nothing to resample.
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;

    fn forward(
        &self,
        inputs: &[Vec<Value>],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Vec<Value>>, NNError>;

    /// Re-initializes all parameters in place, so optimizers keep tracking the same values
    fn reset(&mut self, rng: &mut dyn RngCore);

    /// KL divergence of the weight posterior from the prior
    fn kl(&self) -> Value {
        Value::new(0.0)
    }

    fn set_resample(&mut self, _resample: bool) {}

    fn resample_weights(&self, _rng: &mut dyn RngCore) {}
}

fn check_dims(in_features: usize, out_features: usize) -> Result<(), NNError> {
    if in_features == 0 || out_features == 0 {
        return Err(NNError::InvalidConfiguration(format!(
            "layer dimensions must be positive, got in_features={in_features}, out_features={out_features}"
        )));
    }
    Ok(())
}

fn check_rows(inputs: &[Vec<Value>], expected: usize) -> Result<(), NNError> {
    match inputs.iter().find(|row| row.len() != expected) {
        Some(row) => Err(NNError::ShapeMismatch {
            expected,
            got: row.len(),
        }),
        None => Ok(()),
    }
}

/// Same bound PyTorch uses for `nn.Linear`, so a Bayesian layer starts out close to a
/// deterministic one
fn init_bound(in_features: usize) -> f32 {
    1.0 / (in_features as f32).sqrt()
}

/// `row · weights^T + bias`, with one weight row per output
fn affine(row: &[Value], weights: &[Vec<Value>], bias: Option<&[Value]>) -> Vec<Value> {
    weights
        .iter()
        .enumerate()
        .map(|(o, w)| {
            let output = w.iter().zip(row).map(|(w, x)| w * x).sum::<Value>();
            match bias {
                Some(b) => &output + &b[o],
                None => output,
            }
        })
        .collect()
}

/// A deterministic fully connected layer
pub struct Linear {
    in_features: usize,
    weights: Vec<Vec<Value>>,
    bias: Option<Vec<Value>>,
}

impl Linear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        include_bias: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Self, NNError> {
        check_dims(in_features, out_features)?;
        let mut layer = Self {
            in_features,
            weights: (0..out_features)
                .map(|_| (0..in_features).map(|_| Value::new(0.0)).collect())
                .collect(),
            bias: include_bias.then(|| (0..out_features).map(|_| Value::new(0.0)).collect()),
        };
        layer.reset(rng);
        Ok(layer)
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            weights: (0..out_features)
                .map(|_| (0..in_features).map(|_| Value::new(1.0)).collect())
                .collect(),
            bias: Some((0..out_features).map(|_| Value::new(1.0)).collect()),
        }
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .flatten()
            .chain(self.bias.iter().flatten())
            .cloned()
            .collect()
    }

    fn forward(
        &self,
        inputs: &[Vec<Value>],
        _rng: &mut dyn RngCore,
    ) -> Result<Vec<Vec<Value>>, NNError> {
        check_rows(inputs, self.in_features)?;
        Ok(inputs
            .iter()
            .map(|row| affine(row, &self.weights, self.bias.as_deref()))
            .collect())
    }

    fn reset(&mut self, rng: &mut dyn RngCore) {
        let k = init_bound(self.in_features);
        for p in self.parameters().iter_mut() {
            p.set_data(rng.random_range(-k..=k));
        }
    }
}

/// Independent Gaussians, one (mean, log-variance) pair per scalar parameter
pub struct GaussianParams {
    pub mu: Vec<Value>,
    pub logvar: Vec<Value>,
}

impl GaussianParams {
    fn zeros(n: usize) -> Self {
        Self {
            mu: (0..n).map(|_| Value::new(0.0)).collect(),
            logvar: (0..n).map(|_| Value::new(0.0)).collect(),
        }
    }

    fn reset(&mut self, bound: f32, init_logvar: f32, rng: &mut dyn RngCore) {
        for mu in self.mu.iter_mut() {
            mu.set_data(rng.random_range(-bound..=bound));
        }
        for logvar in self.logvar.iter_mut() {
            logvar.set_data(init_logvar);
        }
    }

    /// Reparameterization trick: `mu + exp(0.5 * logvar) * eps`, differentiable in mu and logvar
    fn sample(&self, noise: &[f32]) -> Vec<Value> {
        self.mu
            .iter()
            .zip(&self.logvar)
            .zip(noise)
            .map(|((mu, logvar), &eps)| mu + &(&logvar.scale(0.5).exp() * &Value::new(eps)))
            .collect()
    }

    /// Closed form KL divergence from a standard normal prior, summed over all scalars
    fn kl(&self) -> Value {
        self.mu
            .iter()
            .zip(&self.logvar)
            .map(|(mu, logvar)| {
                (mu.square() + logvar.exp() - logvar.clone() - Value::new(1.0)).scale(0.5)
            })
            .sum()
    }

    fn parameters(&self) -> impl Iterator<Item = &Value> {
        self.mu.iter().chain(&self.logvar)
    }
}

/// Standard normal draws for every weight and bias of a layer
struct Noise {
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// A fully connected layer whose weights are Gaussian random variables
///
/// Each forward pass realizes the weights once with the reparameterization trick and
/// applies them to every row of the batch. With `resample` disabled, the noise drawn last
/// is reused until [`Module::resample_weights`] is called, making the layer deterministic.
pub struct BayesLinear {
    in_features: usize,
    out_features: usize,
    /// one set of Gaussians per output
    weights: Vec<GaussianParams>,
    bias: Option<GaussianParams>,
    init_logvar: f32,
    resample: bool,
    retained_noise: RefCell<Option<Noise>>,
    n_output_nans: AtomicUsize,
}

impl BayesLinear {
    /// Creates a layer with a bias and the default initial log-variance
    pub fn new(
        in_features: usize,
        out_features: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Self, NNError> {
        Self::with_options(in_features, out_features, true, DEFAULT_INIT_LOGVAR, rng)
    }

    pub fn with_options(
        in_features: usize,
        out_features: usize,
        include_bias: bool,
        init_logvar: f32,
        rng: &mut dyn RngCore,
    ) -> Result<Self, NNError> {
        check_dims(in_features, out_features)?;
        if !init_logvar.is_finite() {
            return Err(NNError::InvalidConfiguration(format!(
                "initial log-variance must be finite, got {init_logvar}"
            )));
        }
        let mut layer = Self {
            in_features,
            out_features,
            weights: (0..out_features)
                .map(|_| GaussianParams::zeros(in_features))
                .collect(),
            bias: include_bias.then(|| GaussianParams::zeros(out_features)),
            init_logvar,
            resample: true,
            retained_noise: RefCell::new(None),
            n_output_nans: AtomicUsize::new(0),
        };
        layer.reset(rng);
        Ok(layer)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn resample(&self) -> bool {
        self.resample
    }

    pub fn weights(&self) -> &[GaussianParams] {
        &self.weights
    }

    pub fn bias(&self) -> Option<&GaussianParams> {
        self.bias.as_ref()
    }

    /// Number of non-finite outputs in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    fn draw_noise(&self, rng: &mut dyn RngCore) -> Noise {
        let mut standard_normal = || -> f32 { StandardNormal.sample(&mut *rng) };
        let weights = (0..self.out_features)
            .map(|_| (0..self.in_features).map(|_| standard_normal()).collect())
            .collect();
        let bias = if self.bias.is_some() {
            (0..self.out_features).map(|_| standard_normal()).collect()
        } else {
            vec![]
        };
        Noise { weights, bias }
    }

    fn realize(&self, noise: &Noise) -> (Vec<Vec<Value>>, Option<Vec<Value>>) {
        let weights = self
            .weights
            .iter()
            .zip(&noise.weights)
            .map(|(params, eps)| params.sample(eps))
            .collect();
        let bias = self.bias.as_ref().map(|params| params.sample(&noise.bias));
        (weights, bias)
    }

    /// Realizes the weights, drawing fresh noise or reusing the retained one
    fn sample_weights(&self, rng: &mut dyn RngCore) -> (Vec<Vec<Value>>, Option<Vec<Value>>) {
        if self.resample {
            return self.realize(&self.draw_noise(rng));
        }
        let mut retained = self.retained_noise.borrow_mut();
        let noise = retained.get_or_insert_with(|| self.draw_noise(rng));
        self.realize(noise)
    }

    // Testing utility, sets every mean and every log-variance to a constant
    #[cfg(test)]
    fn fill(&self, mu: f32, logvar: f32) {
        for params in self.weights.iter().chain(self.bias.iter()) {
            for v in params.mu.iter() {
                v.clone().set_data(mu);
            }
            for v in params.logvar.iter() {
                v.clone().set_data(logvar);
            }
        }
    }
}

impl Module for BayesLinear {
    fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(self.bias.iter())
            .flat_map(|p| p.parameters())
            .cloned()
            .collect()
    }

    fn forward(
        &self,
        inputs: &[Vec<Value>],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Vec<Value>>, NNError> {
        check_rows(inputs, self.in_features)?;
        let (weights, bias) = self.sample_weights(rng);
        let outputs = inputs
            .iter()
            .map(|row| affine(row, &weights, bias.as_deref()))
            .collect::<Vec<_>>();

        let n_output_nans = outputs.iter().flatten().filter(|v| !v.is_finite()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        log::debug!(
            "BayesLinear({}, {}) n_output_nans: {}",
            self.in_features,
            self.out_features,
            n_output_nans
        );
        Ok(outputs)
    }

    fn reset(&mut self, rng: &mut dyn RngCore) {
        let bound = init_bound(self.in_features);
        for params in self.weights.iter_mut().chain(self.bias.iter_mut()) {
            params.reset(bound, self.init_logvar, rng);
        }
        self.retained_noise.replace(None);
    }

    fn kl(&self) -> Value {
        self.weights
            .iter()
            .chain(self.bias.iter())
            .map(GaussianParams::kl)
            .sum()
    }

    /// Switching back to resampling drops the retained noise, so pinning again later
    /// starts from a fresh draw
    fn set_resample(&mut self, resample: bool) {
        self.resample = resample;
        if resample {
            self.retained_noise.replace(None);
        }
    }

    fn resample_weights(&self, rng: &mut dyn RngCore) {
        if !self.resample {
            self.retained_noise.replace(Some(self.draw_noise(rng)));
        }
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of dead neurons in the last batch (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    /// Takes the element-wise ReLU of the input values
    fn forward(
        &self,
        inputs: &[Vec<Value>],
        _rng: &mut dyn RngCore,
    ) -> Result<Vec<Vec<Value>>, NNError> {
        let n_dead_neurons = inputs.iter().flatten().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(inputs
            .iter()
            .map(|row| row.iter().map(|v| v.relu()).collect())
            .collect())
    }

    fn reset(&mut self, _rng: &mut dyn RngCore) {}
}

/// Wraps plain numbers into leaf values, one row per sample
pub fn to_rows(rows: &[Vec<f32>]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|row| row.iter().map(|&x| Value::new(x)).collect())
        .collect()
}
