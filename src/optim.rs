//! Optimizer(s)

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    fn lr(&self) -> f32;
}

fn zero_grads(params: &mut [Value]) {
    for param in params.iter_mut() {
        param.zero_grad();
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Value>,
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (idx, param) in self.params.iter_mut().enumerate() {
            let velocity = self.momentum * self.velocity[idx] - self.lr * param.grad();
            let new_val = param.data() + velocity;
            self.velocity[idx] = velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

/// Adam with bias corrected moment estimates
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    // first moment per parameter
    m: Vec<f32>,
    // second moment per parameter
    v: Vec<f32>,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }

    /// Adam with the usual defaults, `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`
    pub fn default_params(params: Vec<Value>, lr: f32) -> Self {
        Self::new(params, lr, 0.9, 0.999, 1e-8)
    }

    pub fn step_count(&self) -> i32 {
        self.t
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);

        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad();
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * grad;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * grad * grad;
            let m_hat = self.m[idx] / bias_correction1;
            let v_hat = self.v[idx] / bias_correction2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}
