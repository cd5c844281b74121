//! Matrix tensor with gradient tracking

use super::BackwardOp;
use ndarray::{Array1, Array2};
use std::cell::RefCell;
use std::rc::Rc;

/// Row-major matrix with automatic differentiation support
///
/// Vectors are `1 x n` matrices. Cloning shares the gradient cell but copies
/// the data, so a parameter cloned into a graph still receives its gradient.
#[derive(Clone)]
pub struct Tensor {
    data: Array1<f32>,
    rows: usize,
    cols: usize,
    grad: Rc<RefCell<Option<Array1<f32>>>>,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a `rows x cols` tensor from flat row-major data
    ///
    /// # Panics
    ///
    /// Panics when `data.len() != rows * cols`.
    pub fn new(data: Array1<f32>, rows: usize, cols: usize, requires_grad: bool) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "Tensor data length must equal rows * cols"
        );
        Self {
            data,
            rows,
            cols,
            grad: Rc::new(RefCell::new(None)),
            backward_op: None,
            requires_grad,
        }
    }

    /// Create a `1 x n` row vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        let n = data.len();
        Self::new(Array1::from(data), 1, n, requires_grad)
    }

    /// Create a tensor from a 2-D array
    pub fn from_matrix(matrix: &Array2<f32>, requires_grad: bool) -> Self {
        let (rows, cols) = matrix.dim();
        let flat: Array1<f32> = matrix.iter().copied().collect();
        Self::new(flat, rows, cols, requires_grad)
    }

    /// Create a zero-filled matrix
    pub fn zeros(rows: usize, cols: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(rows * cols), rows, cols, requires_grad)
    }

    /// Get reference to data
    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    /// Get mutable reference to data
    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Copy the data out as a 2-D array
    pub fn to_matrix(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.rows, self.cols), |(r, c)| self.data[r * self.cols + c])
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Get gradient (if computed)
    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    /// Set gradient
    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Accumulate gradient (for when tensor is used multiple times)
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut grad_ref = self.grad.borrow_mut();
        if let Some(existing) = grad_ref.as_mut() {
            *existing += &grad;
        } else {
            *grad_ref = Some(grad);
        }
    }

    /// Zero out gradient
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// L2 norm of the current gradient, 0 when none is stored
    pub fn grad_norm(&self) -> f32 {
        self.grad
            .borrow()
            .as_ref()
            .map(|g| g.iter().map(|v| v * v).sum::<f32>().sqrt())
            .unwrap_or(0.0)
    }

    /// Whether the stored gradient contains NaN or infinity
    pub fn has_non_finite_grad(&self) -> bool {
        self.grad
            .borrow()
            .as_ref()
            .is_some_and(|g| g.iter().any(|v| !v.is_finite()))
    }

    /// Check if requires gradient
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Get reference to gradient cell (for backward operations)
    pub fn grad_cell(&self) -> Rc<RefCell<Option<Array1<f32>>>> {
        self.grad.clone()
    }

    /// Set backward operation
    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    /// Get backward operation
    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &(self.rows, self.cols))
            .field("data", &self.data)
            .field("grad", &self.grad.borrow())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}
