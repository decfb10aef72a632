//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Operand data is read before any gradient is written
//! so that an operand used twice (e.g. `a * a`) is never borrowed mutably while shared.

use crate::values::Value;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    Exp,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => 2,
            BackpropFunc::Neg | BackpropFunc::ReLU | BackpropFunc::Exp => 1,
        }
    }
}

fn accumulate(value: &Value, delta: f32) {
    value.0.borrow_mut().grad += delta;
}

/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    accumulate(in1, grad);
    accumulate(in2, grad);
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    accumulate(in1, grad);
    accumulate(in2, -grad);
}

/// Represents backprop for the operation `in1 * in2 = out`
pub fn mul(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let (in1_data, in2_data) = (in1.data(), in2.data());
    accumulate(in1, in2_data * grad);
    accumulate(in2, in1_data * grad);
}

/// Represents backprop for the operation `in1 / in2 = out`
pub fn div(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let (in1_data, in2_data) = (in1.data(), in2.data());
    accumulate(in1, grad / in2_data);
    accumulate(in2, -in1_data * grad / (in2_data * in2_data));
}

/// Represents backprop for the operation `-in = out`
pub fn neg(in1: &Value, out: &Value) {
    accumulate(in1, -out.grad());
}

/// Represents backprop for the operation `in1^in2 = out`
/// only support numerical float powers, da^b/db is only defined for positive a, so gradient is
/// not calculated for the exponent
pub fn pow(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let (in1_data, in2_data) = (in1.data(), in2.data());
    accumulate(in1, in2_data * in1_data.powf(in2_data - 1.0) * grad);
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Value, out: &Value) {
    let grad = out.grad();
    if in1.data() > 0.0 {
        accumulate(in1, grad);
    }
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(in1: &Value, out: &Value) {
    // d exp(x) / dx = exp(x), which is already stored in `out`
    accumulate(in1, out.data() * out.grad());
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Value, in2: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        Some(BackpropFunc::Div) => div(in1, in2, out),
        Some(BackpropFunc::Pow) => pow(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Neg) => neg(in1, out),
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Exp) => exp(in1, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
