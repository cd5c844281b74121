//! Attention-aware relabeling (TransMix)
//!
//! After the classifier's forward pass, each sample's ratio is recomputed from
//! how much attention mass falls on regions taken from the primary image.

use super::labels::{mix_labels, LabelOptions, MixedLabels};
use crate::batch::Labels;
use crate::error::{Error, Result};
use crate::metadata::MixMetadata;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Classifier attention over a patch grid, one row per sample
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMap {
    /// Shape (N, gh * gw), row-major over the grid
    pub weights: Array2<f32>,
    pub grid: (usize, usize),
}

impl AttentionMap {
    pub fn new(weights: Array2<f32>, grid: (usize, usize)) -> Result<Self> {
        let (gh, gw) = grid;
        if gh == 0 || gw == 0 || weights.ncols() != gh * gw {
            return Err(Error::shape(
                &[weights.nrows(), gh * gw],
                &[weights.nrows(), weights.ncols()],
            ));
        }
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::NumericInstability(
                "attention weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(Self { weights, grid })
    }
}

/// Turns per-region ratios and attention into one mixing ratio
pub trait AttentionWeighting {
    /// `regions` is the (gh, gw) share of the primary image per region,
    /// `attention` the flattened attention row and `area_ratio` the
    /// mask-mean fallback.
    fn ratio(
        &self,
        regions: ArrayView2<'_, f32>,
        attention: ArrayView1<'_, f32>,
        area_ratio: f32,
    ) -> f32;

    fn name(&self) -> &str;
}

/// Attention-weighted mean of the region ratios
///
/// Falls back to the area ratio when the attention row carries no mass.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaWeightedAttention;

impl AttentionWeighting for AreaWeightedAttention {
    fn ratio(
        &self,
        regions: ArrayView2<'_, f32>,
        attention: ArrayView1<'_, f32>,
        area_ratio: f32,
    ) -> f32 {
        let total = attention.sum();
        if total <= f32::EPSILON {
            return area_ratio;
        }
        let weighted: f32 = regions
            .iter()
            .zip(attention.iter())
            .map(|(r, a)| r * a)
            .sum();
        (weighted / total).clamp(0.0, 1.0)
    }

    fn name(&self) -> &str {
        "area_weighted"
    }
}

/// Convex blend of the attention ratio and the area ratio
#[derive(Debug, Clone, Copy)]
pub struct BlendedAttention {
    /// Weight of the attention ratio in [0, 1]
    pub attention_share: f32,
}

impl AttentionWeighting for BlendedAttention {
    fn ratio(
        &self,
        regions: ArrayView2<'_, f32>,
        attention: ArrayView1<'_, f32>,
        area_ratio: f32,
    ) -> f32 {
        let s = self.attention_share.clamp(0.0, 1.0);
        let attn = AreaWeightedAttention.ratio(regions, attention, area_ratio);
        s * attn + (1.0 - s) * area_ratio
    }

    fn name(&self) -> &str {
        "blended"
    }
}

/// Recompute labels from attention; returns the new labels and ratios
pub fn relabel_with_attention(
    metadata: &MixMetadata,
    labels: &Labels,
    attention: &AttentionMap,
    weighting: &dyn AttentionWeighting,
    options: impl Into<LabelOptions>,
) -> Result<(MixedLabels, Vec<f32>)> {
    let n = metadata.len();
    if attention.weights.nrows() != n {
        return Err(Error::shape(
            &[n, attention.weights.ncols()],
            &[attention.weights.nrows(), attention.weights.ncols()],
        ));
    }
    let (gh, gw) = attention.grid;
    let regions = metadata.region_ratios(gh, gw);

    let ratios: Vec<f32> = (0..n)
        .map(|i| {
            weighting.ratio(
                regions.index_axis(Axis(0), i),
                attention.weights.row(i),
                metadata.ratios[i],
            )
        })
        .collect();

    let mixed = mix_labels(labels, &ratios, &metadata.partner, options)?;
    Ok((mixed, ratios))
}
