//! Per-dispatch record of how a batch was mixed

use crate::mask::resample::avg_pool;
use crate::mask::{Alignment, MixMask, PartnerTransform};
use crate::policy::PolicyId;
use ndarray::{Array1, Array3, Axis};
use serde::Serialize;

/// Everything the loss side needs to interpret a mixed batch
///
/// Built by the dispatcher for one step and handed to the consumer together
/// with the mixed images; never persisted.
#[derive(Debug, Clone)]
pub struct MixMetadata {
    pub policy: PolicyId,
    /// Progress counter value of the dispatch
    pub step: u64,
    /// Batch-level ratio drawn before mask generation
    pub requested_ratio: f32,
    /// Realized ratio per sample (mask mean, or attention-weighted after relabeling)
    pub ratios: Vec<f32>,
    pub masks: Vec<MixMask>,
    /// `partner[i]` is the batch index blended into sample `i`
    pub partner: Vec<usize>,
    pub transforms: Vec<PartnerTransform>,
    /// Mix block cell logits per sample, learned policies only
    pub block_logits: Option<Vec<Array1<f32>>>,
    /// Hidden layer to mix at, set when images pass through unmixed
    pub feature_layer: Option<usize>,
    /// Transport settings when partner features must be re-aligned first
    pub alignment: Option<Alignment>,
    /// Some optimization budget ran out while generating masks
    pub budget_exhausted: bool,
}

impl MixMetadata {
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Mean realized ratio over the batch
    pub fn mean_ratio(&self) -> f32 {
        if self.ratios.is_empty() {
            return 1.0;
        }
        self.ratios.iter().sum::<f32>() / self.ratios.len() as f32
    }

    /// Every sample kept its own image
    pub fn is_identity(&self) -> bool {
        self.masks.iter().all(MixMask::is_identity)
    }

    /// Images are blended in input space rather than at a hidden layer
    pub fn mixes_images(&self) -> bool {
        self.feature_layer.is_none()
    }

    /// Share of each grid region taken from the primary sample, (N, gh, gw)
    pub fn region_ratios(&self, gh: usize, gw: usize) -> Array3<f32> {
        let mut out = Array3::zeros((self.len(), gh, gw));
        for (mask, mut plane) in self.masks.iter().zip(out.axis_iter_mut(Axis(0))) {
            match mask {
                MixMask::Scalar(lam) => plane.fill(*lam),
                MixMask::Dense(m) => plane.assign(&avg_pool(m.view(), gh, gw)),
            }
        }
        out
    }

    /// Flat summary for logs and the CLI preview
    pub fn summary(&self) -> MixSummary {
        MixSummary {
            policy: self.policy,
            step: self.step,
            requested_ratio: self.requested_ratio,
            mean_ratio: self.mean_ratio(),
            ratios: self.ratios.clone(),
            partner: self.partner.clone(),
            feature_layer: self.feature_layer,
            budget_exhausted: self.budget_exhausted,
        }
    }
}

/// Serializable view of [`MixMetadata`] without the masks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixSummary {
    pub policy: PolicyId,
    pub step: u64,
    pub requested_ratio: f32,
    pub mean_ratio: f32,
    pub ratios: Vec<f32>,
    pub partner: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_layer: Option<usize>,
    pub budget_exhausted: bool,
}
