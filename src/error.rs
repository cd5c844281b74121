//! Error types for Mezclar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Optimization budget exceeded for {samples} samples")]
    OptimizationBudgetExceeded { samples: usize },

    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    /// Build a shape mismatch from two shape slices
    pub fn shape(expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Whether the error should abort the whole run rather than a single step
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
