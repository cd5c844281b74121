//! Mask and mixing-ratio generators
//!
//! A mask holds the weight of the primary sample `a`:
//! `mixed = m * a + (1 - m) * b`. The implied mixing ratio is the mask mean,
//! and a mask of all ones leaves `a` untouched.

pub mod cutmix;
pub mod fmix;
pub mod graphcut;
pub mod mixup;
pub mod puzzle;
pub mod resample;
pub mod resizemix;
pub mod saliency;


use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, ArrayView3};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

pub use cutmix::{BoxPlacement, CutBox, CutMixParams};
pub use fmix::FMixParams;
pub use graphcut::{solve_grid_labeling, GridCut};
pub use mixup::{AlignMixParams, Alignment, ManifoldMixParams, MixupParams};
pub use puzzle::PuzzleMixParams;
pub use resizemix::ResizeMixParams;
pub use saliency::{saliency_map, SaliencyMixParams};

/// Output contract of a generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    Scalar,
    Dense,
}

/// Per-sample mixing weights of the primary image
#[derive(Debug, Clone, PartialEq)]
pub enum MixMask {
    /// Uniform weight λ over the whole image
    Scalar(f32),
    /// Per-pixel weights, shape (H, W)
    Dense(Array2<f32>),
}

impl MixMask {
    /// Mask that returns the primary sample unchanged
    pub fn identity() -> Self {
        Self::Scalar(1.0)
    }

    pub fn kind(&self) -> MaskKind {
        match self {
            Self::Scalar(_) => MaskKind::Scalar,
            Self::Dense(_) => MaskKind::Dense,
        }
    }

    /// Realized mixing ratio (mask mean)
    pub fn ratio(&self) -> f32 {
        match self {
            Self::Scalar(lam) => *lam,
            Self::Dense(m) => m.mean().unwrap_or(1.0),
        }
    }

    /// Weight of `a` at pixel (y, x)
    #[inline]
    pub fn weight(&self, y: usize, x: usize) -> f32 {
        match self {
            Self::Scalar(lam) => *lam,
            Self::Dense(m) => m[[y, x]],
        }
    }

    /// True when every weight equals one
    pub fn is_identity(&self) -> bool {
        match self {
            Self::Scalar(lam) => *lam == 1.0,
            Self::Dense(m) => m.iter().all(|&v| v == 1.0),
        }
    }

    /// Dense masks must match the batch's spatial size
    pub fn check_shape(&self, h: usize, w: usize) -> Result<()> {
        match self {
            Self::Scalar(_) => Ok(()),
            Self::Dense(m) if m.dim() == (h, w) => Ok(()),
            Self::Dense(m) => Err(Error::shape(&[h, w], &[m.nrows(), m.ncols()])),
        }
    }

    /// All weights finite and within [0, 1]
    pub fn check_range(&self) -> Result<()> {
        let ok = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        let valid = match self {
            Self::Scalar(lam) => ok(*lam),
            Self::Dense(m) => m.iter().all(|&v| ok(v)),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::NumericInstability(
                "mask weights outside [0, 1]".to_string(),
            ))
        }
    }

    /// Materialize as an (h, w) weight map
    pub fn to_dense(&self, h: usize, w: usize) -> Array2<f32> {
        match self {
            Self::Scalar(lam) => Array2::from_elem((h, w), *lam),
            Self::Dense(m) => m.clone(),
        }
    }
}

/// How the partner image is placed before blending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartnerTransform {
    /// Partner used pixel-aligned
    #[default]
    Aligned,
    /// Whole partner image resized into a box of the primary image
    Resize(CutBox),
}

/// Beta-distributed mixing ratio with optional clamping bounds
#[derive(Debug, Clone)]
pub struct RatioSampler {
    beta: Beta<f32>,
    bounds: Option<(f32, f32)>,
}

impl RatioSampler {
    /// λ ~ Beta(alpha, alpha)
    pub fn symmetric(alpha: f32) -> Result<Self> {
        Self::new(alpha, alpha)
    }

    /// λ ~ Beta(a, b)
    pub fn new(a: f32, b: f32) -> Result<Self> {
        let beta = Beta::new(a, b).map_err(|e| {
            Error::InvalidParameter(format!("Beta({a}, {b}) is not a valid distribution: {e}"))
        })?;
        Ok(Self { beta, bounds: None })
    }

    /// Clamp every draw into `[lo, hi]`; equal bounds fix λ
    pub fn with_bounds(mut self, lo: f32, hi: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return Err(Error::InvalidParameter(format!(
                "ratio bounds ({lo}, {hi}) must satisfy 0 <= lo <= hi <= 1"
            )));
        }
        self.bounds = Some((lo, hi));
        Ok(self)
    }

    pub fn bounds(&self) -> Option<(f32, f32)> {
        self.bounds
    }

    /// Draw one ratio; consumes the rng even when the bounds pin λ
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let lam = self.beta.sample(rng);
        match self.bounds {
            Some((lo, hi)) => lam.clamp(lo, hi),
            None => lam,
        }
    }
}

/// Inputs for generating the mask of one (a, b) pair
#[derive(Debug, Clone, Copy)]
pub struct PairRequest<'a> {
    /// Position of `a` in the batch
    pub index: usize,
    pub a: ArrayView3<'a, f32>,
    pub b: ArrayView3<'a, f32>,
    pub saliency_a: Option<ArrayView2<'a, f32>>,
    pub saliency_b: Option<ArrayView2<'a, f32>>,
    /// Batch-level requested ratio
    pub ratio: f32,
}

impl PairRequest<'_> {
    pub fn spatial(&self) -> (usize, usize) {
        let (_, h, w) = self.a.dim();
        (h, w)
    }
}

/// Generated mask for one pair plus bookkeeping
#[derive(Debug, Clone)]
pub struct PairMix {
    pub mask: MixMask,
    pub transform: PartnerTransform,
    /// An optimization budget ran out while producing the mask
    pub exhausted: bool,
    /// Mix block auxiliary logits, learned policies only
    pub logits: Option<Array1<f32>>,
}

impl PairMix {
    pub fn new(mask: MixMask) -> Self {
        Self {
            mask,
            transform: PartnerTransform::Aligned,
            exhausted: false,
            logits: None,
        }
    }

    pub fn identity() -> Self {
        Self::new(MixMask::identity())
    }
}
