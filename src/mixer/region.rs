//! Per-region soft targets for region-aware losses

use crate::batch::Labels;
use crate::error::{Error, Result};
use crate::metadata::MixMetadata;
use ndarray::{s, Array4};

/// Soft target per grid region, shape (N, gh, gw, K)
///
/// Region `(y, x)` of sample `i` gets `r·onehot(a) + (1 − r)·onehot(b)` where
/// `r` is the share of that region covered by the primary image.
pub fn region_targets(
    metadata: &MixMetadata,
    labels: &Labels,
    gh: usize,
    gw: usize,
) -> Result<Array4<f32>> {
    let n = metadata.len();
    if labels.len() != n {
        return Err(Error::shape(&[n], &[labels.len()]));
    }
    let k = labels.num_classes();
    let onehot = labels.to_one_hot();
    let regions = metadata.region_ratios(gh, gw);

    let mut out = Array4::zeros((n, gh, gw, k));
    for i in 0..n {
        let a = onehot.row(i);
        let b = onehot.row(metadata.partner[i]);
        for y in 0..gh {
            for x in 0..gw {
                let r = regions[[i, y, x]];
                let mut cell = out.slice_mut(s![i, y, x, ..]);
                cell.assign(&(&a * r + &b * (1.0 - r)));
            }
        }
    }
    Ok(out)
}
