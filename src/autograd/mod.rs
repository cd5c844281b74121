//! Tape-based autograd used by the learned mix block
//!
//! Tensors are row-major matrices stored flat. Every op records a backward
//! closure on its output; calling [`backward`] on a result walks the chain back
//! to the leaves and accumulates their gradients.

mod ops;
mod tensor;


pub use ops::*;
pub use tensor::Tensor;

/// Trait for backward pass operations
pub trait BackwardOp {
    /// Propagate the gradient stored on the op's output into its inputs
    fn backward(&self);
}

/// Perform backward pass on a tensor
///
/// With `grad_output == None` the seed gradient is all ones, which is what a
/// scalar loss wants.
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    let seed = grad_output.unwrap_or_else(|| ndarray::Array1::ones(tensor.len()));
    tensor.set_grad(seed);

    if let Some(op) = tensor.backward_op() {
        op.backward();
    }
}
