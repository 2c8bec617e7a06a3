//! Local gradient rules for the autograd graph
//!
//! Every derived [`Value`] remembers the operation that produced it. During the backward
//! pass the operation's rule pushes the output gradient down to its operands.

use crate::values::Value;

/// The operation that created a node in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    Exp,
    Ln,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => 2,
            BackpropFunc::Neg | BackpropFunc::ReLU | BackpropFunc::Exp | BackpropFunc::Ln => 1,
        }
    }

    /// Accumulates the gradient of `out` into its operands
    pub fn apply(&self, operands: &[Value], out: &Value) {
        debug_assert_eq!(operands.len(), self.n_operands());
        match (self, operands) {
            (BackpropFunc::Add, [a, b]) => add(a, b, out),
            (BackpropFunc::Sub, [a, b]) => sub(a, b, out),
            (BackpropFunc::Mul, [a, b]) => mul(a, b, out),
            (BackpropFunc::Div, [a, b]) => div(a, b, out),
            (BackpropFunc::Pow, [a, b]) => pow(a, b, out),
            (BackpropFunc::Neg, [a]) => neg(a, out),
            (BackpropFunc::ReLU, [a]) => relu(a, out),
            (BackpropFunc::Exp, [a]) => exp(a, out),
            (BackpropFunc::Ln, [a]) => ln(a, out),
            _ => panic!(
                "{:?} expects {} operands, got {}",
                self,
                self.n_operands(),
                operands.len()
            ),
        }
    }
}

fn accumulate(value: &Value, delta: f32) {
    value.0.borrow_mut().grad += delta;
}

/// `a + b = out`
fn add(a: &Value, b: &Value, out: &Value) {
    let grad = out.grad();
    accumulate(a, grad);
    accumulate(b, grad);
}

/// `a - b = out`
fn sub(a: &Value, b: &Value, out: &Value) {
    let grad = out.grad();
    accumulate(a, grad);
    accumulate(b, -grad);
}

/// `a * b = out`
fn mul(a: &Value, b: &Value, out: &Value) {
    let grad = out.grad();
    let (a_data, b_data) = (a.data(), b.data());
    accumulate(a, b_data * grad);
    accumulate(b, a_data * grad);
}

/// `a / b = out`
fn div(a: &Value, b: &Value, out: &Value) {
    let grad = out.grad();
    let (a_data, b_data) = (a.data(), b.data());
    accumulate(a, grad / b_data);
    accumulate(b, -a_data * grad / b_data.powi(2));
}

/// `-a = out`
fn neg(a: &Value, out: &Value) {
    accumulate(a, -out.grad());
}

/// `a^b = out`
///
/// d(a^b)/db = a^b * ln(a) is only defined for a positive base, otherwise the exponent
/// receives no gradient.
fn pow(a: &Value, b: &Value, out: &Value) {
    let grad = out.grad();
    let (a_data, b_data) = (a.data(), b.data());
    accumulate(a, b_data * a_data.powf(b_data - 1.0) * grad);
    if a_data > 0.0 {
        accumulate(b, out.data() * a_data.ln() * grad);
    }
}

/// `relu(a) = out`
fn relu(a: &Value, out: &Value) {
    let grad = out.grad();
    if a.data() > 0.0 {
        accumulate(a, grad);
    }
}

/// `exp(a) = out`
fn exp(a: &Value, out: &Value) {
    // exp(a) is already stored in the output
    accumulate(a, out.data() * out.grad());
}

/// `ln(a) = out`
fn ln(a: &Value, out: &Value) {
    let grad = out.grad();
    accumulate(a, grad / a.data());
}
