//! Loss function(s)
//!
//! All per-example terms are averaged over the batch, for training and validation alike, so
//! losses stay comparable across batch sizes.

use thiserror::Error;

use crate::{model::Prediction, values::Value};

/// Errors for the loss functions
#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    #[error("Got {predictions} predictions for {targets} targets")]
    LengthMismatch { predictions: usize, targets: usize },
    #[error("Cannot compute a loss over an empty batch")]
    EmptyBatch,
    #[error("KL scaling needs a positive count")]
    InvalidKlScaling,
}

fn check_batch(predictions: usize, targets: usize) -> Result<(), LossError> {
    if predictions != targets {
        return Err(LossError::LengthMismatch {
            predictions,
            targets,
        });
    }
    if predictions == 0 {
        return Err(LossError::EmptyBatch);
    }
    Ok(())
}

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Result<Value, LossError>
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        check_batch(y_pred.len(), y_true.len())?;
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| (a.as_ref() - b.as_ref()).square())
            .sum::<Value>();
        Ok(loss / Value::new(y_pred.len() as f32))
    }
}

/// Negative log-likelihood of the targets under the predicted Gaussians, dropping the
/// constant `0.5 * ln(2 pi)`
pub struct GaussianNLLLoss;

impl GaussianNLLLoss {
    pub fn call<U>(predictions: &[Prediction], y_true: &[U]) -> Result<Value, LossError>
    where
        U: AsRef<Value>,
    {
        check_batch(predictions.len(), y_true.len())?;
        let loss = predictions
            .iter()
            .zip(y_true.iter())
            .map(|(pred, target)| {
                // 0.5 * lv + 0.5 * (t - mu)^2 / exp(lv)
                let residual = (target.as_ref() - &pred.mean).square();
                let inverse_variance = (-&pred.log_var).exp();
                (&pred.log_var + &(&residual * &inverse_variance)).scale(0.5)
            })
            .sum::<Value>();
        Ok(loss / Value::new(predictions.len() as f32))
    }
}

/// How the network KL, a sum over every weight, is weighed against the batch averaged
/// likelihood term
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KlScaling {
    /// Add the KL as is
    Unscaled,
    /// Divide by the number of training examples, the loss is then the per-example
    /// negative ELBO
    PerExample { n_train: usize },
    /// Divide by the number of batches per epoch, so one epoch adds up the KL once
    PerBatch { n_batches: usize },
}

impl KlScaling {
    pub fn factor(&self) -> Result<f32, LossError> {
        match *self {
            KlScaling::Unscaled => Ok(1.0),
            KlScaling::PerExample { n_train: 0 } | KlScaling::PerBatch { n_batches: 0 } => {
                Err(LossError::InvalidKlScaling)
            }
            KlScaling::PerExample { n_train: n } | KlScaling::PerBatch { n_batches: n } => {
                Ok(1.0 / n as f32)
            }
        }
    }
}

/// Individual terms of the Bayesian loss
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub nll: Value,
    /// KL after scaling
    pub kl: Value,
    pub total: Value,
}

/// Gaussian negative log-likelihood plus the scaled KL divergence of the network weights
///
/// Non-finite terms are passed through unchanged, it is up to the caller to stop training.
pub struct BayesLoss {
    kl_scaling: KlScaling,
}

impl BayesLoss {
    pub fn new(kl_scaling: KlScaling) -> Result<Self, LossError> {
        kl_scaling.factor()?;
        Ok(Self { kl_scaling })
    }

    pub fn kl_scaling(&self) -> KlScaling {
        self.kl_scaling
    }

    /// `kl` is the summed KL of the network for the forward pass which produced `predictions`
    pub fn call<U>(
        &self,
        predictions: &[Prediction],
        y_true: &[U],
        kl: &Value,
    ) -> Result<LossTerms, LossError>
    where
        U: AsRef<Value>,
    {
        let nll = GaussianNLLLoss::call(predictions, y_true)?;
        let kl = kl.scale(self.kl_scaling.factor()?);
        let total = &nll + &kl;
        Ok(LossTerms { nll, kl, total })
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn prediction(mean: f32, log_var: f32) -> Prediction {
        Prediction {
            mean: Value::new(mean),
            log_var: Value::new(log_var),
        }
    }

    #[test]
    fn test_mse_loss() {
        let y_pred = vec![Value::new(2.0), Value::new(3.0)];
        let y_true = vec![Value::new(1.0), Value::new(5.0)];
        let loss = MSELoss::call(&y_pred, &y_true).unwrap();
        assert_eq!(loss.data(), 2.5);

        loss.backward();
        // dloss / dy_pred = 1/N * 2 * (y_pred - y_true)
        // dloss / dy_true = -1/N * 2 * (y_pred - y_true)
        assert_eq!(y_pred[0].grad(), 1.0);
        assert_eq!(y_pred[1].grad(), -2.0);
        assert_eq!(y_true[0].grad(), -1.0);
        assert_eq!(y_true[1].grad(), 2.0);
    }

    #[test]
    fn test_batch_errors() {
        let y_true = vec![Value::new(1.0)];
        assert_eq!(
            GaussianNLLLoss::call(&[], &y_true).unwrap_err(),
            LossError::LengthMismatch {
                predictions: 0,
                targets: 1
            }
        );
        let empty: [Value; 0] = [];
        assert_eq!(
            MSELoss::call(&empty, &empty).unwrap_err(),
            LossError::EmptyBatch
        );
    }

    #[test]
    fn test_gaussian_nll() {
        // unit variance reduces to half the squared error
        let preds = vec![prediction(1.0, 0.0), prediction(0.0, 0.0)];
        let y_true = vec![Value::new(3.0), Value::new(0.0)];
        let loss = GaussianNLLLoss::call(&preds, &y_true).unwrap();
        assert_eq_float!(loss.data(), 0.5 * (0.5 * 4.0));

        // 0.5 * 2 + 0.5 * 4 / e^2
        let preds = vec![prediction(1.0, 2.0)];
        let loss = GaussianNLLLoss::call(&preds, &[Value::new(3.0)]).unwrap();
        assert_eq_float!(loss.data(), 1.0 + 2.0 / 2.0f32.exp());
    }

    #[test]
    fn test_gaussian_nll_gradients() {
        let preds = vec![prediction(1.0, 0.5)];
        let loss = GaussianNLLLoss::call(&preds, &[Value::new(2.0)]).unwrap();
        loss.backward();
        // dL/dmu = -(t - mu) / var
        // dL/dlv = 0.5 - 0.5 * (t - mu)^2 / var
        let var = 0.5f32.exp();
        assert_eq_float!(preds[0].mean.grad(), -1.0 / var, 1e-5);
        assert_eq_float!(preds[0].log_var.grad(), 0.5 - 0.5 / var, 1e-5);
    }

    #[test]
    fn test_nll_propagates_non_finite() {
        let preds = vec![prediction(f32::NAN, 0.0)];
        let loss = GaussianNLLLoss::call(&preds, &[Value::new(1.0)]).unwrap();
        assert!(loss.data().is_nan());
    }

    #[test]
    fn test_kl_scaling() {
        assert_eq!(KlScaling::Unscaled.factor().unwrap(), 1.0);
        assert_eq!(KlScaling::PerExample { n_train: 4 }.factor().unwrap(), 0.25);
        assert_eq!(KlScaling::PerBatch { n_batches: 2 }.factor().unwrap(), 0.5);
        assert!(BayesLoss::new(KlScaling::PerBatch { n_batches: 0 }).is_err());
    }

    #[test]
    fn test_bayes_loss() {
        let loss_fn = BayesLoss::new(KlScaling::PerExample { n_train: 10 }).unwrap();
        let preds = vec![prediction(0.0, 0.0), prediction(0.0, 0.0)];
        let y_true = vec![Value::new(1.0), Value::new(1.0)];
        let kl = Value::new(5.0);
        let terms = loss_fn.call(&preds, &y_true, &kl).unwrap();
        assert_eq_float!(terms.nll.data(), 0.5);
        assert_eq_float!(terms.kl.data(), 0.5);
        assert_eq_float!(terms.total.data(), 1.0);

        terms.total.backward();
        assert_eq_float!(kl.grad(), 0.1);
    }
}
