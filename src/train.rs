//! Training and validation loops
//!
//! Metrics are averaged over batches. Every batch is checked for non-finite loss terms and
//! parameters; training stops with [`TrainError::NumericInstability`] instead of carrying on
//! with corrupted weights.

use rand::RngCore;
use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{BayesLoss, LossError, LossTerms, MSELoss},
    model::{BayesNet, Prediction},
    nn::NNError,
    optim::Optim,
    values::Value,
};

/// Errors raised while training or validating
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Non-finite {term} ({value}) in batch {batch}")]
    NumericInstability {
        term: &'static str,
        value: f32,
        batch: usize,
    },
    #[error("The data loader yielded no batches, e.g. fewer events than one batch with drop_last")]
    EmptyPass,
    #[error("Training needs at least one epoch")]
    NoEpochs,
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Batch averaged metrics of one pass over a dataset
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f32,
    pub nll: f32,
    /// KL after scaling
    pub kl: f32,
    /// Mean squared error of the predicted means
    pub mse: f32,
    pub n_batches: usize,
}

impl EpochStats {
    fn add_batch(&mut self, terms: &LossTerms, mse: f32) {
        self.loss += terms.total.data();
        self.nll += terms.nll.data();
        self.kl += terms.kl.data();
        self.mse += mse;
        self.n_batches += 1;
    }

    fn averaged(self) -> Result<Self, TrainError> {
        if self.n_batches == 0 {
            return Err(TrainError::EmptyPass);
        }
        let n = self.n_batches as f32;
        Ok(Self {
            loss: self.loss / n,
            nll: self.nll / n,
            kl: self.kl / n,
            mse: self.mse / n,
            n_batches: self.n_batches,
        })
    }
}

/// Metrics of every epoch of a training run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub train: Vec<EpochStats>,
    pub val: Vec<EpochStats>,
}

fn check_finite(term: &'static str, value: f32, batch: usize) -> Result<(), TrainError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TrainError::NumericInstability { term, value, batch })
    }
}

/// MSE of the predicted means, only reported so it is not part of any graph that is backpropagated
fn mean_mse(predictions: &[Prediction], targets: &[Value]) -> Result<f32, TrainError> {
    let means = predictions.iter().map(|p| p.mean.clone()).collect::<Vec<_>>();
    Ok(MSELoss::call(&means, targets)?.data())
}

/// Length of a training run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    /// Log a summary every `print_every` epochs (and after the last one)
    pub print_every: usize,
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.epochs == 0 {
            return Err(TrainError::NoEpochs);
        }
        Ok(())
    }
}

/// One pass over `loader`, taking an optimizer step after every batch
pub fn train_epoch(
    model: &BayesNet,
    loader: &DataLoader,
    loss_fn: &BayesLoss,
    optim: &mut dyn Optim,
    rng: &mut dyn RngCore,
) -> Result<EpochStats, TrainError> {
    let mut stats = EpochStats::default();
    for (batch, (inputs, targets)) in loader.iter(rng).enumerate() {
        let predictions = model.forward(&inputs, rng)?;
        let kl = model.kl();
        check_finite("kl", kl.data(), batch)?;
        let terms = loss_fn.call(&predictions, &targets, &kl)?;
        check_finite("loss", terms.total.data(), batch)?;

        terms.total.backward();
        optim.step();
        optim.zero_grad();
        if let Some(p) = model.parameters().iter().find(|p| !p.is_finite()) {
            return Err(TrainError::NumericInstability {
                term: "parameter",
                value: p.data(),
                batch,
            });
        }

        let mse = mean_mse(&predictions, &targets)?;
        log::debug!(
            "batch {}: loss {}, nll {}, kl {}",
            batch,
            terms.total.data(),
            terms.nll.data(),
            terms.kl.data()
        );
        stats.add_batch(&terms, mse);
    }
    stats.averaged()
}

/// One pass over held out data without updating any parameter
pub fn validate(
    model: &BayesNet,
    loader: &DataLoader,
    loss_fn: &BayesLoss,
    rng: &mut dyn RngCore,
) -> Result<EpochStats, TrainError> {
    let mut stats = EpochStats::default();
    // parameters are fixed during validation, so is the KL
    let kl = model.kl();
    check_finite("kl", kl.data(), 0)?;
    for (batch, (inputs, targets)) in loader.iter(rng).enumerate() {
        let predictions = model.forward(&inputs, rng)?;
        let terms = loss_fn.call(&predictions, &targets, &kl)?;
        check_finite("loss", terms.total.data(), batch)?;

        let mse = mean_mse(&predictions, &targets)?;
        stats.add_batch(&terms, mse);
    }
    stats.averaged()
}

/// Trains for `options.epochs` epochs, validating after each one
pub fn fit(
    model: &BayesNet,
    train_loader: &DataLoader,
    val_loader: &DataLoader,
    loss_fn: &BayesLoss,
    optim: &mut dyn Optim,
    options: FitOptions,
    rng: &mut dyn RngCore,
) -> Result<History, TrainError> {
    options.validate()?;
    let FitOptions {
        epochs,
        print_every,
    } = options;
    let mut history = History::default();
    for epoch in 0..epochs {
        let train = train_epoch(model, train_loader, loss_fn, optim, rng)?;
        let val = validate(model, val_loader, loss_fn, rng)?;
        if epoch % print_every.max(1) == 0 || epoch + 1 == epochs {
            log::info!(
                "epoch: {}, train_loss: {:.4} (nll {:.4}, kl {:.4}), val_loss: {:.4}, val_mse: {:.4}",
                epoch + 1,
                train.loss,
                train.nll,
                train.kl,
                val.loss,
                val.mse
            );
        }
        history.train.push(train);
        history.val.push(val);
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use crate::{
        dataloader::EventTable, loss::KlScaling, model::VarianceModel, optim::Adam,
    };

    use super::*;

    fn linear_table(n: usize, rng: &mut Pcg64Mcg) -> EventTable {
        let samples = (0..n)
            .map(|_| vec![rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)])
            .collect::<Vec<Vec<f32>>>();
        let targets = samples.iter().map(|x| 2.0 * x[0] - x[1]).collect();
        EventTable::new(samples, targets).unwrap()
    }

    fn params_data(model: &BayesNet) -> Vec<f32> {
        model.parameters().iter().map(Value::data).collect()
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let train = linear_table(64, &mut rng);
        let val = linear_table(32, &mut rng);
        let train_loader = DataLoader::new(&train, 16, true, false).unwrap();
        let val_loader = DataLoader::new(&val, 16, false, false).unwrap();

        let model = BayesNet::mlp(2, &[8], VarianceModel::Heteroscedastic, &mut rng).unwrap();
        let loss_fn = BayesLoss::new(KlScaling::PerExample { n_train: train.len() }).unwrap();
        let mut optim = Adam::default_params(model.parameters(), 0.01);

        let history = fit(
            &model,
            &train_loader,
            &val_loader,
            &loss_fn,
            &mut optim,
            FitOptions {
                epochs: 30,
                print_every: 10,
            },
            &mut rng,
        )
        .unwrap();
        assert_eq!(history.train.len(), 30);
        assert_eq!(history.val.len(), 30);
        assert!(history.train.iter().all(|s| s.n_batches == 4));

        let (first, last) = (history.train[0], history.train[29]);
        assert!(last.loss < first.loss, "{} >= {}", last.loss, first.loss);
        assert!(history.val[29].loss < history.val[0].loss);
        assert!(history.val.iter().all(|s| s.loss.is_finite() && s.mse >= 0.0));
    }

    #[test]
    fn test_validate_does_not_update() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let val = linear_table(20, &mut rng);
        let loader = DataLoader::new(&val, 8, false, false).unwrap();
        let model = BayesNet::mlp(2, &[4], VarianceModel::Fixed { log_var: 0.0 }, &mut rng).unwrap();
        let loss_fn = BayesLoss::new(KlScaling::Unscaled).unwrap();

        let before = params_data(&model);
        let stats = validate(&model, &loader, &loss_fn, &mut rng).unwrap();
        assert_eq!(stats.n_batches, 3);
        assert_eq!(params_data(&model), before);
        // an unscaled KL is the same for every batch
        assert!((stats.kl - model.kl().data()).abs() < 1e-3);
    }

    #[test]
    fn test_empty_pass_is_an_error() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let table = linear_table(3, &mut rng);
        let loader = DataLoader::new(&table, 8, false, true).unwrap();
        assert_eq!(loader.n_batches(), 0);
        let model = BayesNet::mlp(2, &[4], VarianceModel::Heteroscedastic, &mut rng).unwrap();
        let loss_fn = BayesLoss::new(KlScaling::Unscaled).unwrap();
        let mut optim = Adam::default_params(model.parameters(), 0.01);

        assert!(matches!(
            train_epoch(&model, &loader, &loss_fn, &mut optim, &mut rng),
            Err(TrainError::EmptyPass)
        ));
        assert!(matches!(
            validate(&model, &loader, &loss_fn, &mut rng),
            Err(TrainError::EmptyPass)
        ));
    }

    #[test]
    fn test_fit_needs_epochs() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let table = linear_table(8, &mut rng);
        let loader = DataLoader::new(&table, 4, false, false).unwrap();
        let model = BayesNet::mlp(2, &[4], VarianceModel::Heteroscedastic, &mut rng).unwrap();
        let loss_fn = BayesLoss::new(KlScaling::Unscaled).unwrap();
        let mut optim = Adam::default_params(model.parameters(), 0.01);
        let before = params_data(&model);

        let options = FitOptions {
            epochs: 0,
            print_every: 1,
        };
        assert!(matches!(options.validate(), Err(TrainError::NoEpochs)));
        let err = fit(&model, &loader, &loader, &loss_fn, &mut optim, options, &mut rng);
        assert!(matches!(err, Err(TrainError::NoEpochs)));
        assert_eq!(params_data(&model), before);
    }

    #[test]
    fn test_non_finite_loss_aborts() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let train = linear_table(16, &mut rng);
        let loader = DataLoader::new(&train, 8, true, false).unwrap();
        let model = BayesNet::mlp(2, &[4], VarianceModel::Heteroscedastic, &mut rng).unwrap();
        let loss_fn = BayesLoss::new(KlScaling::PerBatch { n_batches: 2 }).unwrap();
        let mut optim = Adam::default_params(model.parameters(), 0.01);

        model.parameters()[0].clone().set_data(f32::INFINITY);
        let err = train_epoch(&model, &loader, &loss_fn, &mut optim, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            TrainError::NumericInstability { batch: 0, .. }
        ));
    }
}
