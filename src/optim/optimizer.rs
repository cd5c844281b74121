//! Optimizer trait

use crate::error::{Error, Result};
use crate::Tensor;

/// Trait for optimization algorithms
pub trait Optimizer {
    /// Perform a single optimization step
    ///
    /// Fails with [`Error::NumericInstability`] before touching any parameter
    /// when a gradient is not finite.
    fn step(&mut self, params: &mut [Tensor]) -> Result<()>;

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [Tensor]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Reject NaN/inf gradients instead of letting them reach the weights
pub fn check_finite_grads(params: &[Tensor]) -> Result<()> {
    if let Some(idx) = params.iter().position(Tensor::has_non_finite_grad) {
        return Err(Error::NumericInstability(format!(
            "non-finite gradient in parameter {idx}"
        )));
    }
    Ok(())
}

/// Rescale gradients so their global L2 norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &mut [Tensor], max_norm: f32) -> f32 {
    let total = params
        .iter()
        .map(|p| p.grad_norm().powi(2))
        .sum::<f32>()
        .sqrt();

    if total > max_norm && total > 0.0 {
        let factor = max_norm / total;
        for param in params.iter() {
            if let Some(grad) = param.grad() {
                param.set_grad(grad * factor);
            }
        }
    }

    total
}
