//! Autograd operations with backward passes
//!
//! Only the ops the mix block needs: a per-cell MLP is `matmul -> add_bias ->
//! relu -> matmul -> add_bias -> shift_to_mean -> sigmoid`.

use super::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

fn propagate(inputs: &[&Tensor]) {
    for input in inputs {
        if let Some(op) = input.backward_op() {
            op.backward();
        }
    }
}

/// Matrix multiplication `C = A @ B`
///
/// # Panics
///
/// Panics when `a.cols() != b.rows()`.
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.cols(), b.rows(), "Matrix inner dimensions must agree");
    let (m, k, n) = (a.rows(), a.cols(), b.cols());

    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let lhs = a.data()[i * k + p];
            if lhs == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += lhs * b.data()[p * n + j];
            }
        }
    }

    let requires_grad = a.requires_grad() || b.requires_grad();
    let mut result = Tensor::new(Array1::from(out), m, n, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let (m, k, n) = (self.a.rows(), self.a.cols(), self.b.cols());

            // ∂L/∂A = ∂L/∂C @ B^T
            if self.a.requires_grad() {
                let mut grad_a = vec![0.0; m * k];
                for i in 0..m {
                    for p in 0..k {
                        let mut sum = 0.0;
                        for j in 0..n {
                            sum += grad_output[i * n + j] * self.b.data()[p * n + j];
                        }
                        grad_a[i * k + p] = sum;
                    }
                }
                self.a.accumulate_grad(Array1::from(grad_a));
            }

            // ∂L/∂B = A^T @ ∂L/∂C
            if self.b.requires_grad() {
                let mut grad_b = vec![0.0; k * n];
                for i in 0..m {
                    for p in 0..k {
                        let lhs = self.a.data()[i * k + p];
                        for j in 0..n {
                            grad_b[p * n + j] += lhs * grad_output[i * n + j];
                        }
                    }
                }
                self.b.accumulate_grad(Array1::from(grad_b));
            }
        }
        propagate(&[&self.a, &self.b]);
    }
}

/// Add a `1 x cols` bias to every row of `x`
///
/// # Panics
///
/// Panics when the bias is not a row vector of width `x.cols()`.
pub fn add_bias(x: &Tensor, bias: &Tensor) -> Tensor {
    assert_eq!(bias.rows(), 1, "Bias must be a row vector");
    assert_eq!(bias.cols(), x.cols(), "Bias width must match columns");
    let cols = x.cols();

    let data = Array1::from_iter(
        x.data()
            .iter()
            .enumerate()
            .map(|(idx, &v)| v + bias.data()[idx % cols]),
    );

    let requires_grad = x.requires_grad() || bias.requires_grad();
    let mut result = Tensor::new(data, x.rows(), cols, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBiasBackward {
            x: x.clone(),
            bias: bias.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBiasBackward {
    x: Tensor,
    bias: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBiasBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                self.x.accumulate_grad(grad.clone());
            }
            if self.bias.requires_grad() {
                // bias gradient sums over rows
                let cols = self.bias.cols();
                let mut grad_bias = Array1::zeros(cols);
                for (idx, g) in grad.iter().enumerate() {
                    grad_bias[idx % cols] += g;
                }
                self.bias.accumulate_grad(grad_bias);
            }
        }
        propagate(&[&self.x, &self.bias]);
    }
}

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0));
    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, a.rows(), a.cols(), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ReluBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ReluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * (a > 0)
                let grad_a = grad * &self.a.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                self.a.accumulate_grad(grad_a);
            }
        }
        propagate(&[&self.a]);
    }
}

/// Logistic sigmoid, maps logits to mask weights in (0, 1)
pub fn sigmoid(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| 1.0 / (1.0 + (-x).exp()));
    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data.clone(), a.rows(), a.cols(), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SigmoidBackward {
            a: a.clone(),
            output: data,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SigmoidBackward {
    a: Tensor,
    output: Array1<f32>,
    result_grad: GradCell,
}

impl BackwardOp for SigmoidBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂σ/∂x = σ(x) * (1 - σ(x))
                let local = self.output.mapv(|s| s * (1.0 - s));
                self.a.accumulate_grad(grad * &local);
            }
        }
        propagate(&[&self.a]);
    }
}

/// Mean of all elements as a `1 x 1` tensor
pub fn mean(a: &Tensor) -> Tensor {
    let n = a.len().max(1) as f32;
    let value = a.data().sum() / n;
    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(Array1::from(vec![value]), 1, 1, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MeanBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MeanBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MeanBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let share = grad[0] / self.a.len().max(1) as f32;
                self.a.accumulate_grad(Array1::from_elem(self.a.len(), share));
            }
        }
        propagate(&[&self.a]);
    }
}

/// Shift every element by the scalar `b` for which the `weights`-weighted
/// mean of `sigmoid(a + b)` equals `target`
///
/// `b` is found by bisection and depends on `a`; the backward pass
/// differentiates through that dependence, so only the part of the gradient
/// that keeps the weighted mean fixed reaches `a`. `weights` must be
/// non-negative with a positive sum.
///
/// # Panics
///
/// Panics when `weights.len() != a.len()`.
pub fn shift_to_mean(a: &Tensor, target: f32, weights: &Array1<f32>) -> Tensor {
    assert_eq!(weights.len(), a.len(), "One weight per element");
    let total: f64 = weights.iter().map(|&w| w as f64).sum();
    let weights: Vec<f64> = weights
        .iter()
        .map(|&w| if total > 0.0 { w as f64 / total } else { 0.0 })
        .collect();
    let target = (target as f64).clamp(0.0, 1.0);

    let weighted_mean = |b: f64| -> f64 {
        a.data()
            .iter()
            .zip(&weights)
            .map(|(&x, w)| w / (1.0 + (-(x as f64 + b)).exp()))
            .sum()
    };

    let (min, max) = a
        .data()
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x as f64), hi.max(x as f64))
        });
    let (mut lo, mut hi) = if a.is_empty() {
        (0.0, 0.0)
    } else {
        (-max - SHIFT_SPAN, -min + SHIFT_SPAN)
    };
    for _ in 0..SHIFT_BISECTION_ITERS {
        let mid = 0.5 * (lo + hi);
        if weighted_mean(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let shift = 0.5 * (lo + hi);

    let data = a.data().mapv(|x| (x as f64 + shift) as f32);
    let slopes: Array1<f32> = data.mapv(|z| {
        let s = 1.0 / (1.0 + (-z).exp());
        s * (1.0 - s)
    });

    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, a.rows(), a.cols(), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ShiftBackward {
            a: a.clone(),
            weights: Array1::from_iter(weights.iter().map(|&w| w as f32)),
            slopes,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

/// Beyond this distance from every logit the sigmoid is saturated in f32
const SHIFT_SPAN: f64 = 40.0;
const SHIFT_BISECTION_ITERS: usize = 60;

struct ShiftBackward {
    a: Tensor,
    weights: Array1<f32>,
    slopes: Array1<f32>,
    result_grad: GradCell,
}

impl BackwardOp for ShiftBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // db/da_i = -w_i s_i / Σ w_j s_j with s the sigmoid slope
                let weighted = &self.weights * &self.slopes;
                let norm = weighted.sum();
                let grad_a = if norm > f32::EPSILON {
                    let total = grad.sum();
                    grad - &(weighted * (total / norm))
                } else {
                    grad.clone()
                };
                self.a.accumulate_grad(grad_a);
            }
        }
        propagate(&[&self.a]);
    }
}
