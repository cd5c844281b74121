//! Sample and label mixing
//!
//! Applies the generated masks to the batch, mixes the labels with the
//! realized ratios and provides the helpers a consumer needs afterwards:
//! attention relabeling, per-region targets, hidden-feature mixing and the
//! gradient with respect to the mask.

mod align;
mod attention;
mod labels;
mod region;

pub use align::{align_features, mix_aligned_features, transport_plan, TransportPlan};
pub use attention::{
    relabel_with_attention, AreaWeightedAttention, AttentionMap, AttentionWeighting,
    BlendedAttention,
};
pub use labels::{
    check_distribution, mix_labels, LabelMode, LabelOptions, MixedLabels, RatioRescale,
    RescaleMode, DISTRIBUTION_TOLERANCE,
};
pub use region::region_targets;

use crate::batch::ImageBatch;
use crate::error::{Error, Result};
use crate::mask::resample::resize_bilinear;
use crate::mask::{MixMask, PartnerTransform};
use crate::metadata::MixMetadata;
use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayViewD, Axis, Zip};

/// A mixed batch ready for the classifier
#[derive(Debug, Clone)]
pub struct MixOutput {
    /// Mixed images, or the originals when mixing happens at a hidden layer
    pub images: Array4<f32>,
    pub labels: MixedLabels,
    pub metadata: MixMetadata,
}

/// Partner image `j` as seen by sample `i` after its transform
pub fn partner_canvas(batch: &ImageBatch, j: usize, transform: &PartnerTransform) -> Array3<f32> {
    let b = batch.image(j);
    match transform {
        PartnerTransform::Aligned => b.to_owned(),
        PartnerTransform::Resize(cut) => {
            let mut canvas = b.to_owned();
            if !cut.is_empty() {
                let resized = resize_bilinear(b, cut.height, cut.width);
                canvas
                    .slice_mut(s![
                        ..,
                        cut.top..cut.top + cut.height,
                        cut.left..cut.left + cut.width
                    ])
                    .assign(&resized);
            }
            canvas
        }
    }
}

fn check_metadata(batch: &ImageBatch, metadata: &MixMetadata) -> Result<()> {
    let n = batch.len();
    let (_, h, w) = batch.image_dims();
    for len in [
        metadata.masks.len(),
        metadata.partner.len(),
        metadata.transforms.len(),
    ] {
        if len != n {
            return Err(Error::shape(&[n], &[len]));
        }
    }
    if let Some(&bad) = metadata.partner.iter().find(|&&j| j >= n) {
        return Err(Error::InvalidParameter(format!(
            "partner index {bad} out of range for batch of {n}"
        )));
    }
    for mask in &metadata.masks {
        mask.check_shape(h, w)?;
        mask.check_range()?;
    }
    Ok(())
}

/// Blend the batch according to `metadata` and mix the labels
///
/// Realized ratios are taken from the masks and written back into the
/// returned metadata. Dense masks of the wrong spatial size fail with a shape
/// mismatch; non-finite results fail with numeric instability.
pub fn mix(
    batch: &ImageBatch,
    mut metadata: MixMetadata,
    labels: impl Into<LabelOptions>,
) -> Result<MixOutput> {
    check_metadata(batch, &metadata)?;
    metadata.ratios = metadata.masks.iter().map(MixMask::ratio).collect();

    let mut images = batch.images().clone();
    if metadata.mixes_images() {
        for (i, mut out) in images.axis_iter_mut(Axis(0)).enumerate() {
            let mask = &metadata.masks[i];
            if mask.is_identity() {
                continue;
            }
            let b = partner_canvas(batch, metadata.partner[i], &metadata.transforms[i]);
            match mask {
                MixMask::Scalar(lam) => {
                    let lam = *lam;
                    Zip::from(&mut out)
                        .and(&b)
                        .for_each(|x, &y| *x = lam * *x + (1.0 - lam) * y);
                }
                MixMask::Dense(m) => {
                    for (mut plane, b_plane) in out.outer_iter_mut().zip(b.outer_iter()) {
                        Zip::from(&mut plane)
                            .and(&b_plane)
                            .and(m)
                            .for_each(|x, &y, &w| *x = w * *x + (1.0 - w) * y);
                    }
                }
            }
        }
        if images.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericInstability(
                "mixed images contain non-finite values".to_string(),
            ));
        }
    }

    let labels = mix_labels(batch.labels(), &metadata.ratios, &metadata.partner, labels)?;
    Ok(MixOutput {
        images,
        labels,
        metadata,
    })
}

/// dL/d(mask) per sample from dL/d(mixed images)
///
/// `mixed = m·a + (1 − m)·b'` so `dL/dm = Σ_c dL/dmixed · (a − b')`.
pub fn mask_gradients(
    batch: &ImageBatch,
    metadata: &MixMetadata,
    input_grad: &Array4<f32>,
) -> Result<Vec<Array2<f32>>> {
    if input_grad.dim() != batch.images().dim() {
        let (n, c, h, w) = batch.images().dim();
        let (gn, gc, gh, gw) = input_grad.dim();
        return Err(Error::shape(&[n, c, h, w], &[gn, gc, gh, gw]));
    }
    check_metadata(batch, metadata)?;
    let (_, h, w) = batch.image_dims();

    let grads = (0..batch.len())
        .map(|i| {
            let a = batch.image(i);
            let b = partner_canvas(batch, metadata.partner[i], &metadata.transforms[i]);
            let g = input_grad.index_axis(Axis(0), i);
            let mut out = Array2::zeros((h, w));
            for ((g_plane, a_plane), b_plane) in
                g.outer_iter().zip(a.outer_iter()).zip(b.outer_iter())
            {
                Zip::from(&mut out)
                    .and(&g_plane)
                    .and(&a_plane)
                    .and(&b_plane)
                    .for_each(|o, &g, &a, &b| *o += g * (a - b));
            }
            out
        })
        .collect();
    Ok(grads)
}

/// Mix hidden features along their first (batch) axis
///
/// Used with ManifoldMix: `out[i] = r_i·f[i] + (1 − r_i)·f[partner[i]]`.
pub fn mix_features(features: ArrayViewD<'_, f32>, metadata: &MixMetadata) -> Result<ArrayD<f32>> {
    let n = metadata.len();
    if features.ndim() == 0 || features.len_of(Axis(0)) != n {
        return Err(Error::shape(&[n], &features.shape()[..features.ndim().min(1)]));
    }
    let mut out = features.to_owned();
    for (i, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let r = metadata.ratios[i];
        let other = features.index_axis(Axis(0), metadata.partner[i]);
        Zip::from(&mut row)
            .and(&other)
            .for_each(|x, &y| *x = r * *x + (1.0 - r) * y);
    }
    Ok(out)
}
