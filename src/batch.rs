//! Input batches handed over by the data-loading collaborator

use crate::error::{Error, Result};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};

/// Class labels for a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    /// One class index per sample
    Indices {
        classes: Vec<usize>,
        num_classes: usize,
    },
    /// One probability row per sample, shape (N, K)
    Soft(Array2<f32>),
}

impl Labels {
    /// Hard labels; every index must be below `num_classes`
    pub fn indices(classes: Vec<usize>, num_classes: usize) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::InvalidParameter(
                "num_classes must be > 0".to_string(),
            ));
        }
        if let Some(&bad) = classes.iter().find(|&&c| c >= num_classes) {
            return Err(Error::InvalidParameter(format!(
                "class index {bad} out of range for {num_classes} classes"
            )));
        }
        Ok(Self::Indices {
            classes,
            num_classes,
        })
    }

    /// Soft labels, rows are expected to be probability distributions
    pub fn soft(rows: Array2<f32>) -> Self {
        Self::Soft(rows)
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        match self {
            Self::Indices { classes, .. } => classes.len(),
            Self::Soft(rows) => rows.nrows(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of classes K
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Indices { num_classes, .. } => *num_classes,
            Self::Soft(rows) => rows.ncols(),
        }
    }

    /// Dense (N, K) targets; hard labels become one-hot rows
    pub fn to_one_hot(&self) -> Array2<f32> {
        match self {
            Self::Indices {
                classes,
                num_classes,
            } => {
                let mut out = Array2::zeros((classes.len(), *num_classes));
                for (row, &class) in classes.iter().enumerate() {
                    out[[row, class]] = 1.0;
                }
                out
            }
            Self::Soft(rows) => rows.clone(),
        }
    }

    /// Labels reordered so that row `i` holds the label of `order[i]`
    pub fn permuted(&self, order: &[usize]) -> Self {
        match self {
            Self::Indices {
                classes,
                num_classes,
            } => Self::Indices {
                classes: order.iter().map(|&j| classes[j]).collect(),
                num_classes: *num_classes,
            },
            Self::Soft(rows) => Self::Soft(rows.select(Axis(0), order)),
        }
    }
}

/// A batch of images (N, C, H, W) with labels and optional saliency maps
#[derive(Debug, Clone)]
pub struct ImageBatch {
    images: Array4<f32>,
    labels: Labels,
    saliency: Option<Array3<f32>>,
}

impl ImageBatch {
    /// Pair images with labels
    ///
    /// Fails with a shape mismatch when the label count differs from N and
    /// with an invalid parameter on an empty batch.
    pub fn new(images: Array4<f32>, labels: Labels) -> Result<Self> {
        let n = images.len_of(Axis(0));
        if n == 0 {
            return Err(Error::InvalidParameter("empty batch".to_string()));
        }
        if labels.len() != n {
            return Err(Error::shape(&[n], &[labels.len()]));
        }
        Ok(Self {
            images,
            labels,
            saliency: None,
        })
    }

    /// Attach host-computed saliency maps of shape (N, H, W)
    pub fn with_saliency(mut self, saliency: Array3<f32>) -> Result<Self> {
        let (n, _, h, w) = self.images.dim();
        if saliency.dim() != (n, h, w) {
            let (sn, sh, sw) = saliency.dim();
            return Err(Error::shape(&[n, h, w], &[sn, sh, sw]));
        }
        if saliency.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::InvalidParameter(
                "saliency maps must be finite and non-negative".to_string(),
            ));
        }
        self.saliency = Some(saliency);
        Ok(self)
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    /// Always false, empty batches are rejected at construction
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (C, H, W) of every image
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    /// All images
    pub fn images(&self) -> &Array4<f32> {
        &self.images
    }

    /// Image `i` as (C, H, W)
    pub fn image(&self, i: usize) -> ArrayView3<'_, f32> {
        self.images.index_axis(Axis(0), i)
    }

    /// Labels
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Host-supplied saliency for sample `i`, if any
    pub fn saliency(&self, i: usize) -> Option<ArrayView2<'_, f32>> {
        self.saliency.as_ref().map(|s| s.index_axis(Axis(0), i))
    }

    /// Whether host saliency was attached
    pub fn has_saliency(&self) -> bool {
        self.saliency.is_some()
    }
}
