//! Optimizers for the learned mix block
//!
//! The mix block owns one of these exclusively; its state is never shared with
//! the host classifier's optimizer.

mod adam;
mod optimizer;
mod sgd;

pub use adam::Adam;
pub use optimizer::{check_finite_grads, clip_grad_norm, Optimizer};
pub use sgd::SGD;
