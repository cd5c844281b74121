//! ResizeMix: the whole partner image shrunk into a box of the primary

use super::cutmix::{box_mask, CutBox};
use super::{MixMask, PairMix, PartnerTransform, RatioSampler};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct ResizeMixParams {
    pub ratio: RatioSampler,
    /// Range of the box scale τ relative to the image side
    pub scope: (f32, f32),
    /// Derive τ = sqrt(1 - λ) from a Beta draw instead of τ ~ U(scope)
    pub use_alpha: bool,
}

impl ResizeMixParams {
    /// Requested ratio, λ = 1 - τ²
    pub fn draw_ratio<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let tau = if self.use_alpha {
            (1.0 - self.ratio.sample(rng)).max(0.0).sqrt()
        } else {
            let (lo, hi) = self.scope;
            if hi > lo {
                rng.random_range(lo..hi)
            } else {
                lo
            }
        };
        let tau = tau.clamp(self.scope.0, self.scope.1);
        1.0 - tau * tau
    }
}

/// Box for ratio `lam`, resized partner goes inside
pub fn resize_paste<R: Rng + ?Sized>(h: usize, w: usize, lam: f32, rng: &mut R) -> PairMix {
    let tau = (1.0 - lam).clamp(0.0, 1.0).sqrt();
    let bh = ((h as f32) * tau).round() as usize;
    let bw = ((w as f32) * tau).round() as usize;
    if bh == 0 || bw == 0 {
        return PairMix::identity();
    }
    let (bh, bw) = (bh.min(h), bw.min(w));

    let cut = CutBox {
        top: rng.random_range(0..=h - bh),
        left: rng.random_range(0..=w - bw),
        height: bh,
        width: bw,
    };
    PairMix {
        mask: MixMask::Dense(box_mask(h, w, &cut)),
        transform: PartnerTransform::Resize(cut),
        exhausted: false,
        logits: None,
    }
}
