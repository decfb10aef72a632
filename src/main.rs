//! Trains a Bayesian neural network to regress the differential cross section of toy
//! collider events, using the library provided by `hep_bnn`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --epochs 20 --variance heteroscedastic
//! ```
//!
//! Writes a plot of the predictions with their uncertainties and the loss curves to the
//! output directory.

use std::{
    error::Error,
    fmt::{self, Display},
    fs,
};

use hep_bnn::{
    dataloader::{DataLoader, train_val_split},
    datasets::{EventConfig, Process, generate_events},
    loss::{BayesLoss, KlScaling},
    model::{BayesNet, VarianceModel},
    nn::to_rows,
    optim::{Adam, Optim, SGD},
    plots::{plot_loss_curves, plot_predictions},
    preprocess::{Standardizer, TargetTransform},
    train::{FitOptions, fit},
};

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Variance {
    Heteroscedastic,
    Fixed,
    Learned,
}

#[derive(Debug, ValueEnum, Clone, Copy)]
enum KlNorm {
    None,
    Examples,
    Batches,
}

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Optimizer {
    Sgd,
    Adam,
}

macro_rules! impl_display_lowercase(
    ($($t:ty),*) => {
        $(impl Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&format!("{:?}", self).to_lowercase())
            }
        })*
    }
);
impl_display_lowercase!(Variance, KlNorm, Optimizer);

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = Process::MuonPair)]
    process: Process,
    #[clap(short, long, default_value_t = 2000)]
    n_events: usize,
    /// Relative smearing of the cross sections
    #[clap(long, default_value_t = 0.05)]
    noise: f32,
    #[clap(long, default_value_t = 0.2)]
    val_fraction: f32,
    #[clap(short, long, default_value_t = 32)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 20)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.005)]
    lr: f32,
    #[clap(long, default_value_t = Optimizer::Adam)]
    optimizer: Optimizer,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(long, value_delimiter = ',', default_value = "32,32")]
    hidden_units: Vec<usize>,
    #[clap(long, default_value_t = Variance::Heteroscedastic)]
    variance: Variance,
    /// Log-variance of the fixed model, or the initial value of the learned one
    #[clap(long, default_value_t = -2.0, allow_hyphen_values = true)]
    log_var: f32,
    #[clap(long, default_value_t = KlNorm::Examples)]
    kl_norm: KlNorm,
    /// Weight samples per event when predicting
    #[clap(long, default_value_t = 30)]
    mc_samples: usize,
    #[clap(short, long, default_value_t = 5)]
    print_epochs: usize,
    #[clap(long, default_value_t = 42)]
    seed: u64,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let fit_options = FitOptions {
        epochs: args.epochs,
        print_every: args.print_epochs,
    };
    // fail before generating any events
    fit_options.validate()?;
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);

    let events = generate_events(
        &EventConfig {
            process: args.process,
            n_events: args.n_events,
            noise: args.noise,
            ..Default::default()
        },
        &mut rng,
    )?;
    let (train, val) = train_val_split(&events, args.val_fraction, &mut rng)?;

    // statistics come from the training events only
    let scaler = Standardizer::fit(train.samples())?;
    let target_transform = TargetTransform::fit(train.targets())?;
    let train = target_transform.transform(&scaler.transform(&train)?)?;
    let val_raw_targets = val.targets().to_vec();
    let val = target_transform.transform(&scaler.transform(&val)?)?;
    log::info!(
        "{} training and {} validation events of {}",
        train.len(),
        val.len(),
        args.process
    );

    let variance = match args.variance {
        Variance::Heteroscedastic => VarianceModel::Heteroscedastic,
        Variance::Fixed => VarianceModel::Fixed {
            log_var: args.log_var,
        },
        Variance::Learned => VarianceModel::Learned {
            init_log_var: args.log_var,
        },
    };
    let model = BayesNet::mlp(train.n_features(), &args.hidden_units, variance, &mut rng)?;

    let train_loader = DataLoader::new(&train, args.batch_size, true, false)?;
    let val_loader = DataLoader::new(&val, args.batch_size, false, false)?;
    let kl_scaling = match args.kl_norm {
        KlNorm::None => KlScaling::Unscaled,
        KlNorm::Examples => KlScaling::PerExample {
            n_train: train.len(),
        },
        KlNorm::Batches => KlScaling::PerBatch {
            n_batches: train_loader.n_batches(),
        },
    };
    let loss_fn = BayesLoss::new(kl_scaling)?;
    let mut optim: Box<dyn Optim> = match args.optimizer {
        Optimizer::Sgd => Box::new(SGD::new(model.parameters(), args.lr, args.momentum)),
        Optimizer::Adam => Box::new(Adam::default_params(model.parameters(), args.lr)),
    };
    log::info!(
        "training {} parameters with {} (lr {}), {} variance, KL normalized by {}",
        model.parameters().len(),
        args.optimizer,
        optim.lr(),
        args.variance,
        args.kl_norm
    );

    let history = fit(
        &model,
        &train_loader,
        &val_loader,
        &loss_fn,
        optim.as_mut(),
        fit_options,
        &mut rng,
    )?;

    let summaries = model.predict(&to_rows(val.samples()), args.mc_samples, &mut rng)?;
    let predicted = summaries
        .iter()
        .map(|s| target_transform.inverse(s.mean))
        .collect::<Vec<_>>();
    // relative widths on the original scale
    let sigma = summaries
        .iter()
        .zip(&predicted)
        .map(|(s, p)| p * target_transform.relative_width(s.sigma_total()))
        .collect::<Vec<_>>();
    let mean_sigma_model =
        summaries.iter().map(|s| s.sigma_model).sum::<f32>() / summaries.len() as f32;
    let mean_sigma_stoch =
        summaries.iter().map(|s| s.sigma_stoch).sum::<f32>() / summaries.len() as f32;
    log::info!(
        "mean predictive uncertainty (standardized log space): model {:.4}, stochastic {:.4}",
        mean_sigma_model,
        mean_sigma_stoch
    );

    fs::create_dir_all(&args.output_dir)?;
    plot_predictions(
        &val_raw_targets,
        &predicted,
        &sigma,
        &format!("{}/predictions_{}.png", args.output_dir, args.process),
        &format!("dsigma/dOmega [pb], {}", args.process),
    )?;
    plot_loss_curves(
        &history,
        &format!("{}/loss_{}.png", args.output_dir, args.process),
    )?;
    Ok(())
}
