//! Bayesian neural networks for regressing collider event observables,
//! built on a small scalar autograd engine with a PyTorch-like API.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod plots;
pub mod preprocess;
pub mod train;
pub mod values;
