//! Mix policies, their registry and the per-batch dispatcher

mod dispatch;
mod registry;
mod schedule;

pub use dispatch::{step_rng, MixDispatcher, OddSample, PairingMode, PoolEntry};
pub use registry::PolicyRegistry;
pub use schedule::{draw_index, FixedSwitch, LinearSwitch, RandomSwitch, SwitchSchedule};

use crate::error::{Error, Result};
use crate::mask::{
    cutmix, fmix, puzzle, resizemix, saliency, AlignMixParams, Alignment, CutMixParams,
    FMixParams, ManifoldMixParams, MaskKind, MixMask, MixupParams, PairMix, PairRequest,
    PuzzleMixParams, ResizeMixParams, SaliencyMixParams,
};
use crate::mixblock::{LearnedMixParams, MixBlock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a mixing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyId {
    Identity,
    Mixup,
    CutMix,
    FMix,
    ResizeMix,
    SaliencyMix,
    PuzzleMix,
    AutoMix,
    SAMix,
    TransMix,
    ManifoldMix,
    AlignMix,
}

impl PolicyId {
    pub const ALL: [PolicyId; 12] = [
        Self::Identity,
        Self::Mixup,
        Self::CutMix,
        Self::FMix,
        Self::ResizeMix,
        Self::SaliencyMix,
        Self::PuzzleMix,
        Self::AutoMix,
        Self::SAMix,
        Self::TransMix,
        Self::ManifoldMix,
        Self::AlignMix,
    ];

    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Mixup => "mixup",
            Self::CutMix => "cutmix",
            Self::FMix => "fmix",
            Self::ResizeMix => "resizemix",
            Self::SaliencyMix => "saliencymix",
            Self::PuzzleMix => "puzzlemix",
            Self::AutoMix => "automix",
            Self::SAMix => "samix",
            Self::TransMix => "transmix",
            Self::ManifoldMix => "manifoldmix",
            Self::AlignMix => "alignmix",
        }
    }

    /// Shape of the masks the policy emits
    pub fn mask_kind(&self) -> MaskKind {
        match self {
            Self::Identity | Self::Mixup | Self::ManifoldMix | Self::AlignMix => {
                MaskKind::Scalar
            }
            _ => MaskKind::Dense,
        }
    }

    /// Masks come from the trainable mix block
    pub fn is_learned(&self) -> bool {
        matches!(self, Self::AutoMix | Self::SAMix)
    }

    pub fn needs_saliency(&self) -> bool {
        matches!(self, Self::SaliencyMix | Self::PuzzleMix)
    }

    /// Labels are re-weighted from classifier attention after the forward pass
    pub fn uses_attention(&self) -> bool {
        matches!(self, Self::TransMix)
    }

    /// Hyperparameter keys accepted in configuration
    pub fn param_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Identity => &[],
            Self::Mixup | Self::SaliencyMix | Self::AutoMix | Self::SAMix => {
                &["alpha", "ratio_bounds"]
            }
            Self::CutMix | Self::TransMix => &["alpha", "ratio_bounds", "placement"],
            Self::FMix => &[
                "alpha",
                "ratio_bounds",
                "decay_power",
                "max_soft",
                "reformulate",
                "threshold_iters",
            ],
            Self::ResizeMix => &["alpha", "ratio_bounds", "scope", "use_alpha"],
            Self::PuzzleMix => &[
                "alpha",
                "ratio_bounds",
                "grid",
                "beta",
                "max_flow_augmentations",
                "max_bisection_iters",
            ],
            Self::ManifoldMix => &["alpha", "ratio_bounds", "layers"],
            Self::AlignMix => &[
                "alpha",
                "ratio_bounds",
                "layers",
                "sinkhorn_iters",
                "epsilon",
            ],
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// A configured policy: one variant per tag, owning its hyperparameters
#[derive(Debug, Clone)]
pub enum MixPolicy {
    Identity,
    Mixup(MixupParams),
    CutMix(CutMixParams),
    FMix(FMixParams),
    ResizeMix(ResizeMixParams),
    SaliencyMix(SaliencyMixParams),
    PuzzleMix(PuzzleMixParams),
    AutoMix(LearnedMixParams),
    SAMix(LearnedMixParams),
    TransMix(CutMixParams),
    ManifoldMix(ManifoldMixParams),
    AlignMix(AlignMixParams),
}

impl MixPolicy {
    pub fn id(&self) -> PolicyId {
        match self {
            Self::Identity => PolicyId::Identity,
            Self::Mixup(_) => PolicyId::Mixup,
            Self::CutMix(_) => PolicyId::CutMix,
            Self::FMix(_) => PolicyId::FMix,
            Self::ResizeMix(_) => PolicyId::ResizeMix,
            Self::SaliencyMix(_) => PolicyId::SaliencyMix,
            Self::PuzzleMix(_) => PolicyId::PuzzleMix,
            Self::AutoMix(_) => PolicyId::AutoMix,
            Self::SAMix(_) => PolicyId::SAMix,
            Self::TransMix(_) => PolicyId::TransMix,
            Self::ManifoldMix(_) => PolicyId::ManifoldMix,
            Self::AlignMix(_) => PolicyId::AlignMix,
        }
    }

    /// Batch-level requested ratio; always the first draw of a step
    pub fn draw_ratio<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        match self {
            Self::Identity => 1.0,
            Self::Mixup(p) => p.ratio.sample(rng),
            Self::CutMix(p) | Self::TransMix(p) => p.ratio.sample(rng),
            Self::FMix(p) => p.ratio.sample(rng),
            Self::ResizeMix(p) => p.draw_ratio(rng),
            Self::SaliencyMix(p) => p.ratio.sample(rng),
            Self::PuzzleMix(p) => p.ratio.sample(rng),
            Self::AutoMix(p) | Self::SAMix(p) => p.ratio.sample(rng),
            Self::ManifoldMix(p) => p.ratio.sample(rng),
            Self::AlignMix(p) => p.ratio.sample(rng),
        }
    }

    /// Hidden layer whose features get mixed, feature-level policies only
    pub fn draw_feature_layer<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        match self {
            Self::ManifoldMix(p) => Some(p.draw_layer(rng)),
            Self::AlignMix(p) => Some(p.draw_layer(rng)),
            _ => None,
        }
    }

    /// Transport settings for re-aligning partner features, AlignMix only
    pub fn alignment(&self) -> Option<Alignment> {
        match self {
            Self::AlignMix(p) => Some(p.alignment),
            _ => None,
        }
    }

    /// Mask for one (a, b) pair
    ///
    /// Learned policies need the run's mix block; saliency-guided ones read
    /// the saliency maps carried by the request.
    pub fn generate_pair<R: Rng + ?Sized>(
        &self,
        req: &PairRequest<'_>,
        rng: &mut R,
        block: Option<&mut MixBlock>,
    ) -> Result<PairMix> {
        let (h, w) = req.spatial();
        let lam = req.ratio;
        let mix = match self {
            Self::Identity => PairMix::identity(),
            Self::Mixup(_) | Self::ManifoldMix(_) | Self::AlignMix(_) => {
                PairMix::new(MixMask::Scalar(lam))
            }
            Self::CutMix(p) | Self::TransMix(p) => {
                PairMix::new(cutmix::cutmix_mask(h, w, lam, p.placement, rng))
            }
            Self::FMix(p) => PairMix::new(fmix::fmix_mask(h, w, lam, p, rng).mask),
            Self::ResizeMix(_) => resizemix::resize_paste(h, w, lam, rng),
            Self::SaliencyMix(_) => {
                let sal_b = req.saliency_b.ok_or_else(|| missing_saliency(self.id()))?;
                PairMix::new(saliency::saliencymix_mask(lam, sal_b))
            }
            Self::PuzzleMix(p) => {
                let sal_a = req.saliency_a.ok_or_else(|| missing_saliency(self.id()))?;
                let sal_b = req.saliency_b.ok_or_else(|| missing_saliency(self.id()))?;
                let outcome = puzzle::puzzle_mask(sal_a, sal_b, lam, p);
                let mut mix = PairMix::new(outcome.mask);
                mix.exhausted = outcome.exhausted;
                mix
            }
            Self::AutoMix(_) | Self::SAMix(_) => {
                let block = block.ok_or_else(|| {
                    Error::ConfigError(format!("policy {} requires a mix_block", self.id()))
                })?;
                let out = block.forward(req.index, req.a, req.b, lam)?;
                let mut mix = PairMix::new(MixMask::Dense(out.mask));
                mix.logits = Some(out.logits);
                mix
            }
        };
        Ok(mix)
    }
}

fn missing_saliency(id: PolicyId) -> Error {
    Error::InvalidParameter(format!("policy {id} needs saliency maps for both images"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::RatioSampler;
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn request<'a>(a: &'a Array3<f32>, b: &'a Array3<f32>, ratio: f32) -> PairRequest<'a> {
        PairRequest {
            index: 0,
            a: a.view(),
            b: b.view(),
            saliency_a: None,
            saliency_b: None,
            ratio,
        }
    }

    #[test]
    fn test_names_roundtrip_through_serde() {
        for id in PolicyId::ALL {
            let yaml = serde_yaml::to_string(&id).unwrap();
            assert_eq!(yaml.trim(), id.name());
            let back: PolicyId = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn test_mask_kinds() {
        assert_eq!(PolicyId::Mixup.mask_kind(), MaskKind::Scalar);
        assert_eq!(PolicyId::PuzzleMix.mask_kind(), MaskKind::Dense);
        assert!(PolicyId::SAMix.is_learned());
        assert!(PolicyId::TransMix.uses_attention());
    }

    #[test]
    fn test_identity_draws_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(MixPolicy::Identity.draw_ratio(&mut rng), 1.0);
    }

    #[test]
    fn test_saliency_policies_require_maps() {
        let img = Array3::zeros((1, 4, 4));
        let policy = MixPolicy::SaliencyMix(SaliencyMixParams {
            ratio: RatioSampler::symmetric(1.0).unwrap(),
        });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = policy
            .generate_pair(&request(&img, &img, 0.5), &mut rng, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_learned_policy_without_block_is_config_error() {
        let img = Array3::zeros((3, 4, 4));
        let policy = MixPolicy::AutoMix(LearnedMixParams {
            ratio: RatioSampler::symmetric(2.0).unwrap(),
        });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = policy
            .generate_pair(&request(&img, &img, 0.5), &mut rng, None)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_manifold_draws_layer_in_range() {
        let policy = MixPolicy::ManifoldMix(ManifoldMixParams {
            ratio: RatioSampler::symmetric(1.0).unwrap(),
            layers: (1, 3),
        });
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..20 {
            let layer = policy.draw_feature_layer(&mut rng).unwrap();
            assert!((1..=3).contains(&layer));
        }
        assert!(MixPolicy::Identity.draw_feature_layer(&mut rng).is_none());
    }

    #[test]
    fn test_alignmix_is_scalar_with_layer_and_alignment() {
        let policy = MixPolicy::AlignMix(AlignMixParams {
            ratio: RatioSampler::symmetric(1.0).unwrap(),
            layers: (2, 2),
            alignment: Alignment::default(),
        });
        assert_eq!(policy.id().mask_kind(), MaskKind::Scalar);
        assert_eq!(policy.alignment(), Some(Alignment::default()));

        let mut rng = ChaCha8Rng::seed_from_u64(6);
        assert_eq!(policy.draw_feature_layer(&mut rng), Some(2));
        let img = Array3::zeros((3, 4, 4));
        let mix = policy
            .generate_pair(&request(&img, &img, 0.3), &mut rng, None)
            .unwrap();
        assert_eq!(mix.mask, MixMask::Scalar(0.3));
        assert!(MixPolicy::Identity.alignment().is_none());
    }
}
