//! Regression networks composed from an ordered list of modules
//!
//! The network predicts a Gaussian for every input row: a mean and a log-variance. How the
//! log-variance is obtained is part of the network's contract, see [`VarianceModel`].

use rand::RngCore;

use crate::{
    nn::{BayesLinear, Module, NNError, ReLU},
    values::Value,
};

/// Source of the predicted log-variance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VarianceModel {
    /// The last module outputs two values per row, the mean and the log-variance
    Heteroscedastic,
    /// The last module outputs the mean, the log-variance is a constant
    Fixed { log_var: f32 },
    /// The last module outputs the mean, the log-variance is a single trainable parameter
    Learned { init_log_var: f32 },
}

impl VarianceModel {
    /// Number of values the last module has to produce per row
    pub fn head_width(&self) -> usize {
        match self {
            VarianceModel::Heteroscedastic => 2,
            VarianceModel::Fixed { .. } | VarianceModel::Learned { .. } => 1,
        }
    }
}

/// Predicted Gaussian for one row
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mean: Value,
    pub log_var: Value,
}

/// Monte Carlo summary of the predictive distribution for one row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictiveSummary {
    /// Mean over weight samples of the predicted means
    pub mean: f32,
    /// Spread of the predicted means across weight samples (model uncertainty)
    pub sigma_model: f32,
    /// `sqrt` of the average predicted variance (noise in the data itself)
    pub sigma_stoch: f32,
}

impl PredictiveSummary {
    /// Both uncertainties added in quadrature
    pub fn sigma_total(&self) -> f32 {
        (self.sigma_model.powi(2) + self.sigma_stoch.powi(2)).sqrt()
    }
}

/// Where the log-variance of every prediction comes from
enum LogVarHead {
    PerRow,
    Constant(f32),
    Trainable { log_var: Value, init_log_var: f32 },
}

impl LogVarHead {
    fn new(variance: VarianceModel) -> Self {
        match variance {
            VarianceModel::Heteroscedastic => LogVarHead::PerRow,
            VarianceModel::Fixed { log_var } => LogVarHead::Constant(log_var),
            VarianceModel::Learned { init_log_var } => LogVarHead::Trainable {
                log_var: Value::new(init_log_var),
                init_log_var,
            },
        }
    }
}

/// A network of modules applied in order, followed by a Gaussian output head
pub struct BayesNet {
    layers: Vec<Box<dyn Module>>,
    variance: VarianceModel,
    head: LogVarHead,
}

impl BayesNet {
    pub fn new(layers: Vec<Box<dyn Module>>, variance: VarianceModel) -> Result<Self, NNError> {
        if layers.is_empty() {
            return Err(NNError::InvalidConfiguration(
                "a network needs at least one layer".to_string(),
            ));
        }
        Ok(Self {
            layers,
            variance,
            head: LogVarHead::new(variance),
        })
    }

    /// Builds `BayesLinear -> ReLU -> ... -> BayesLinear`, with the last layer sized for the
    /// variance model's head
    pub fn mlp(
        n_inputs: usize,
        hidden: &[usize],
        variance: VarianceModel,
        rng: &mut dyn RngCore,
    ) -> Result<Self, NNError> {
        let mut layers: Vec<Box<dyn Module>> = vec![];
        let mut n_in = n_inputs;
        for &n_out in hidden {
            layers.push(Box::new(BayesLinear::new(n_in, n_out, rng)?));
            layers.push(Box::new(ReLU::new()));
            n_in = n_out;
        }
        layers.push(Box::new(BayesLinear::new(
            n_in,
            variance.head_width(),
            rng,
        )?));
        Self::new(layers, variance)
    }

    pub fn variance_model(&self) -> VarianceModel {
        self.variance
    }

    pub fn parameters(&self) -> Vec<Value> {
        let mut params = self
            .layers
            .iter()
            .flat_map(|l| l.parameters())
            .collect::<Vec<_>>();
        if let LogVarHead::Trainable { log_var, .. } = &self.head {
            params.push(log_var.clone());
        }
        params
    }

    /// Sum of the KL divergences of all layers
    pub fn kl(&self) -> Value {
        self.layers.iter().map(|l| l.kl()).sum()
    }

    pub fn forward(
        &self,
        inputs: &[Vec<Value>],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Prediction>, NNError> {
        let mut hidden = inputs.to_vec();
        for layer in self.layers.iter() {
            hidden = layer.forward(&hidden, rng)?;
        }

        let expected = self.variance.head_width();
        hidden
            .into_iter()
            .map(|row| {
                if row.len() != expected {
                    return Err(NNError::ShapeMismatch {
                        expected,
                        got: row.len(),
                    });
                }
                let mut row = row.into_iter();
                let mean = row.next().ok_or(NNError::ShapeMismatch { expected, got: 0 })?;
                let log_var = match &self.head {
                    LogVarHead::PerRow => {
                        row.next().ok_or(NNError::ShapeMismatch { expected, got: 1 })?
                    }
                    LogVarHead::Constant(log_var) => Value::new(*log_var),
                    LogVarHead::Trainable { log_var, .. } => log_var.clone(),
                };
                Ok(Prediction { mean, log_var })
            })
            .collect()
    }

    /// Predictive mean and uncertainties from `n_samples` forward passes, each with freshly
    /// sampled weights. The resample mode of the layers is left untouched, so with pinned
    /// noise the model uncertainty comes out as zero.
    pub fn predict(
        &self,
        inputs: &[Vec<Value>],
        n_samples: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<PredictiveSummary>, NNError> {
        if n_samples == 0 {
            return Err(NNError::InvalidConfiguration(
                "at least one sample is needed for a prediction".to_string(),
            ));
        }
        let mut means = vec![Vec::with_capacity(n_samples); inputs.len()];
        let mut variances = vec![0.0f32; inputs.len()];
        for _ in 0..n_samples {
            for (i, pred) in self.forward(inputs, rng)?.into_iter().enumerate() {
                means[i].push(pred.mean.data());
                variances[i] += pred.log_var.data().exp();
            }
        }

        let n = n_samples as f32;
        Ok(means
            .iter()
            .zip(variances)
            .map(|(samples, variance_sum)| {
                let mean = samples.iter().sum::<f32>() / n;
                let spread = samples.iter().map(|m| (m - mean).powi(2)).sum::<f32>() / n;
                PredictiveSummary {
                    mean,
                    sigma_model: spread.sqrt(),
                    sigma_stoch: (variance_sum / n).sqrt(),
                }
            })
            .collect())
    }

    pub fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    pub fn reset(&mut self, rng: &mut dyn RngCore) {
        for layer in self.layers.iter_mut() {
            layer.reset(rng);
        }
        if let LogVarHead::Trainable {
            log_var,
            init_log_var,
        } = &mut self.head
        {
            log_var.set_data(*init_log_var);
        }
    }

    pub fn set_resample(&mut self, resample: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_resample(resample);
        }
    }

    pub fn resample_weights(&self, rng: &mut dyn RngCore) {
        for layer in self.layers.iter() {
            layer.resample_weights(rng);
        }
    }
}
