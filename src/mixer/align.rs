//! Feature alignment for AlignMix
//!
//! Each spatial location of a (C, h, w) feature map is a point in feature
//! space carrying mass 1 / (h·w). An entropic transport plan between the two
//! maps (Sinkhorn iterations under a fixed budget) moves the partner's
//! features onto the primary's locations; the realigned map is then blended
//! with the primary at the sample's ratio.

use crate::error::{Error, Result};
use crate::mask::Alignment;
use crate::metadata::MixMetadata;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use tracing::debug;

/// Largest relative row-marginal error accepted as converged
const MARGINAL_TOLERANCE: f64 = 1e-6;

/// Entropic transport plan between two feature maps
#[derive(Debug, Clone)]
pub struct TransportPlan {
    /// (L, L) with L = h·w; rows are the primary's locations
    pub plan: Array2<f32>,
    pub iterations: usize,
    /// max |L · row_sum − 1| after the last iteration
    pub residual: f32,
    pub converged: bool,
}

fn check_alignment(alignment: &Alignment) -> Result<()> {
    if alignment.sinkhorn_iters == 0 {
        return Err(Error::InvalidParameter(
            "sinkhorn_iters must be > 0".to_string(),
        ));
    }
    if !(alignment.epsilon.is_finite() && alignment.epsilon > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "alignment epsilon {} must be finite and > 0",
            alignment.epsilon
        )));
    }
    Ok(())
}

/// Feature map as an (h·w, C) matrix of location vectors
fn locations(feat: ArrayView3<'_, f32>) -> Array2<f64> {
    let (c, h, w) = feat.dim();
    Array2::from_shape_fn((h * w, c), |(p, ch)| f64::from(feat[[ch, p / w, p % w]]))
}

/// Transport plan from `feat_b`'s locations to `feat_a`'s
///
/// The cost is the squared distance between location vectors; `epsilon` is
/// taken relative to the largest cost so the plan does not depend on the
/// feature scale. Column marginals are exact after every iteration, row
/// marginals within `residual`.
pub fn transport_plan(
    feat_a: ArrayView3<'_, f32>,
    feat_b: ArrayView3<'_, f32>,
    alignment: Alignment,
) -> Result<TransportPlan> {
    check_alignment(&alignment)?;
    if feat_a.dim() != feat_b.dim() {
        return Err(Error::shape(feat_a.shape(), feat_b.shape()));
    }
    if feat_a.iter().chain(feat_b.iter()).any(|v| !v.is_finite()) {
        return Err(Error::NumericInstability(
            "feature maps contain non-finite values".to_string(),
        ));
    }

    let xa = locations(feat_a);
    let xb = locations(feat_b);
    let l = xa.nrows();
    if l == 0 {
        return Err(Error::InvalidParameter(
            "feature maps have no spatial locations".to_string(),
        ));
    }

    let sq_a: Array1<f64> = xa.rows().into_iter().map(|r| r.dot(&r)).collect();
    let sq_b: Array1<f64> = xb.rows().into_iter().map(|r| r.dot(&r)).collect();
    let mut kernel = xa.dot(&xb.t());
    Zip::indexed(&mut kernel).for_each(|(i, j), c| *c = (sq_a[i] + sq_b[j] - 2.0 * *c).max(0.0));
    let scale = kernel.fold(0.0f64, |m, &c| m.max(c));
    let eps = f64::from(alignment.epsilon) * if scale > 0.0 { scale } else { 1.0 };

    // shifting each row by its minimum only rescales u
    for mut row in kernel.rows_mut() {
        let min = row.fold(f64::INFINITY, |m, &c| m.min(c));
        row.mapv_inplace(|c| (-(c - min) / eps).exp());
    }

    let mass = 1.0 / l as f64;
    let mut u = Array1::<f64>::ones(l);
    let mut v = Array1::<f64>::ones(l);
    let mut iterations = 0;
    let mut residual = f64::INFINITY;
    while iterations < alignment.sinkhorn_iters {
        iterations += 1;
        let kv = kernel.dot(&v);
        Zip::from(&mut u).and(&kv).for_each(|u, &s| {
            if s > 0.0 {
                *u = mass / s;
            }
        });
        let ktu = kernel.t().dot(&u);
        Zip::from(&mut v).and(&ktu).for_each(|v, &s| {
            if s > 0.0 {
                *v = mass / s;
            }
        });

        let rows = &u * &kernel.dot(&v);
        residual = rows.fold(0.0f64, |m, &r| m.max((r / mass - 1.0).abs()));
        if residual < MARGINAL_TOLERANCE {
            break;
        }
    }

    let plan = Array2::from_shape_fn((l, l), |(i, j)| (u[i] * kernel[[i, j]] * v[j]) as f32);
    Ok(TransportPlan {
        plan,
        iterations,
        residual: residual as f32,
        converged: residual < MARGINAL_TOLERANCE,
    })
}

/// `feat_b` moved onto `feat_a`'s locations: `b'[:, i] = L · Σ_j P[i, j] · b[:, j]`
fn align_pair(
    feat_a: ArrayView3<'_, f32>,
    feat_b: ArrayView3<'_, f32>,
    alignment: Alignment,
) -> Result<(Array3<f32>, bool)> {
    let transport = transport_plan(feat_a, feat_b, alignment)?;
    let (c, h, w) = feat_b.dim();
    let l = h * w;
    let xb = Array2::from_shape_fn((l, c), |(p, ch)| feat_b[[ch, p / w, p % w]]);
    let moved = transport.plan.dot(&xb) * l as f32;
    let aligned = Array3::from_shape_fn((c, h, w), |(ch, y, x)| moved[[y * w + x, ch]]);
    Ok((aligned, transport.converged))
}

/// Re-align every map of `feat_b` to the matching map of `feat_a`
///
/// Both batches are (N, C, h, w). Samples whose transport ran out of
/// iterations still get the best plan found.
pub fn align_features(
    feat_a: ArrayView4<'_, f32>,
    feat_b: ArrayView4<'_, f32>,
    alignment: Alignment,
) -> Result<Array4<f32>> {
    if feat_a.dim() != feat_b.dim() {
        return Err(Error::shape(feat_a.shape(), feat_b.shape()));
    }
    let mut out = Array4::zeros(feat_b.dim());
    let mut exhausted = 0;
    for (n, mut slot) in out.axis_iter_mut(Axis(0)).enumerate() {
        let (aligned, converged) = align_pair(
            feat_a.index_axis(Axis(0), n),
            feat_b.index_axis(Axis(0), n),
            alignment,
        )?;
        if !converged {
            exhausted += 1;
        }
        slot.assign(&aligned);
    }
    if exhausted > 0 {
        debug!(
            samples = exhausted,
            sinkhorn_iters = alignment.sinkhorn_iters,
            "feature alignment stopped at its iteration budget"
        );
    }
    Ok(out)
}

/// AlignMix at the host's hidden layer
///
/// `out[i] = r_i·f[i] + (1 − r_i)·align(f[partner[i]] → f[i])`. Samples
/// paired with themselves pass through.
pub fn mix_aligned_features(
    features: ArrayView4<'_, f32>,
    metadata: &MixMetadata,
) -> Result<Array4<f32>> {
    let alignment = metadata.alignment.ok_or_else(|| {
        Error::InvalidParameter(format!(
            "policy {} carries no alignment settings",
            metadata.policy
        ))
    })?;
    let n = metadata.len();
    let got = features.len_of(Axis(0));
    if got != n || metadata.ratios.len() != n || metadata.partner.len() != n {
        return Err(Error::shape(&[n], &[got]));
    }
    if let Some(&bad) = metadata.partner.iter().find(|&&j| j >= n) {
        return Err(Error::InvalidParameter(format!(
            "partner index {bad} out of range for batch of {n}"
        )));
    }

    let mut out = features.to_owned();
    for (i, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let j = metadata.partner[i];
        let r = metadata.ratios[i];
        if j == i || r >= 1.0 {
            continue;
        }
        let (aligned, _) = align_pair(
            features.index_axis(Axis(0), i),
            features.index_axis(Axis(0), j),
            alignment,
        )?;
        Zip::from(&mut row)
            .and(&aligned)
            .for_each(|x, &y| *x = r * *x + (1.0 - r) * y);
    }
    Ok(out)
}
