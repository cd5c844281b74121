//! Scalar-ratio policies: Mixup, ManifoldMix and AlignMix

use super::RatioSampler;
use rand::Rng;

/// Mixup: λ ~ Beta(α, α), whole-image blend
#[derive(Debug, Clone)]
pub struct MixupParams {
    pub ratio: RatioSampler,
}

/// ManifoldMix: scalar ratio applied to the hidden features of one layer
#[derive(Debug, Clone)]
pub struct ManifoldMixParams {
    pub ratio: RatioSampler,
    /// Inclusive range of layer indices the mixing layer is drawn from
    pub layers: (usize, usize),
}

impl ManifoldMixParams {
    pub fn draw_layer<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        draw_layer(self.layers, rng)
    }
}

/// Entropic transport settings used to re-align partner features
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Sinkhorn iteration budget per sample
    pub sinkhorn_iters: usize,
    /// Entropic regularization, relative to the largest transport cost
    pub epsilon: f32,
}

impl Default for Alignment {
    fn default() -> Self {
        Self {
            sinkhorn_iters: 100,
            epsilon: 0.1,
        }
    }
}

/// AlignMix: like ManifoldMix, but the partner's feature map is moved onto
/// the primary's locations by optimal transport before blending
#[derive(Debug, Clone)]
pub struct AlignMixParams {
    pub ratio: RatioSampler,
    pub layers: (usize, usize),
    pub alignment: Alignment,
}

impl AlignMixParams {
    pub fn draw_layer<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        draw_layer(self.layers, rng)
    }
}

fn draw_layer<R: Rng + ?Sized>((lo, hi): (usize, usize), rng: &mut R) -> usize {
    rng.random_range(lo..=hi)
}
