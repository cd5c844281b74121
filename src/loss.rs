//! Losses over mixed targets
//!
//! The host owns its loss. It implements [`LossFn`] to score one sample
//! against a target distribution, and [`mixed_loss`] lifts that to a mixed
//! batch: soft and two-hot targets are scored directly, pair targets as
//! `λ·L(a) + (1 − λ)·L(b)`.

use crate::error::{Error, Result};
use crate::mixer::MixedLabels;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Per-sample loss with its gradient with respect to the logits
///
/// # Example
///
/// ```
/// use mezclar::loss::{mixed_loss, LossFn};
/// use mezclar::MixedLabels;
/// use ndarray::{arr2, Array1, ArrayView1};
///
/// struct Squared;
///
/// impl LossFn for Squared {
///     fn sample_loss(&self, logits: ArrayView1<'_, f32>, target: ArrayView1<'_, f32>)
///         -> (f32, Array1<f32>) {
///         let diff = &logits - &target;
///         (diff.mapv(|d| d * d).sum(), diff * 2.0)
///     }
///
///     fn name(&self) -> &str {
///         "squared"
///     }
/// }
///
/// let labels = MixedLabels::Soft(arr2(&[[0.7, 0.3]]));
/// let out = mixed_loss(&Squared, &arr2(&[[0.7, 0.3]]), &labels)?;
/// assert_eq!(out.loss, 0.0);
/// # Ok::<(), mezclar::Error>(())
/// ```
pub trait LossFn {
    fn sample_loss(&self, logits: ArrayView1<'_, f32>, target: ArrayView1<'_, f32>)
        -> (f32, Array1<f32>);

    fn name(&self) -> &str;
}

/// Batch-mean loss and its (N, K) logit gradient
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    pub grad: Array2<f32>,
}

/// Score `logits` (N, K) against mixed targets with any per-sample loss
pub fn mixed_loss(
    loss_fn: &dyn LossFn,
    logits: &Array2<f32>,
    labels: &MixedLabels,
) -> Result<LossOutput> {
    let n = labels.len();
    if logits.nrows() != n {
        return Err(Error::shape(&[n, logits.ncols()], &[logits.nrows(), logits.ncols()]));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericInstability("non-finite logits".to_string()));
    }

    let scale = 1.0 / n.max(1) as f32;
    let mut grad = Array2::zeros(logits.raw_dim());
    let mut total = 0.0;

    match labels {
        MixedLabels::Soft(targets) | MixedLabels::TwoHot(targets) => {
            check_classes(logits, targets.ncols())?;
            for (i, (row, target)) in logits
                .axis_iter(Axis(0))
                .zip(targets.axis_iter(Axis(0)))
                .enumerate()
            {
                let (l, g) = loss_fn.sample_loss(row, target);
                total += l;
                grad.row_mut(i).assign(&(g * scale));
            }
        }
        MixedLabels::Pair {
            label_a,
            label_b,
            ratios,
        } => {
            check_classes(logits, label_a.num_classes())?;
            let a = label_a.to_one_hot();
            let b = label_b.to_one_hot();
            for (i, row) in logits.axis_iter(Axis(0)).enumerate() {
                let r = ratios[i];
                let (la, ga) = loss_fn.sample_loss(row, a.row(i));
                let (lb, gb) = loss_fn.sample_loss(row, b.row(i));
                total += r * la + (1.0 - r) * lb;
                grad.row_mut(i).assign(&((ga * r + gb * (1.0 - r)) * scale));
            }
        }
    }

    let loss = total * scale;
    if !loss.is_finite() {
        return Err(Error::NumericInstability(format!(
            "{} loss is not finite",
            loss_fn.name()
        )));
    }
    Ok(LossOutput { loss, grad })
}

fn check_classes(logits: &Array2<f32>, k: usize) -> Result<()> {
    if logits.ncols() != k {
        return Err(Error::shape(&[logits.nrows(), k], &[logits.nrows(), logits.ncols()]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Labels;
    use crate::mixer::{mix_labels, LabelMode};
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    /// Softmax cross entropy, linear in the target
    struct CrossEntropy;

    impl LossFn for CrossEntropy {
        fn sample_loss(
            &self,
            logits: ArrayView1<'_, f32>,
            target: ArrayView1<'_, f32>,
        ) -> (f32, Array1<f32>) {
            let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let exp = logits.mapv(|v| (v - max).exp());
            let probs = &exp / exp.sum();
            let ce: f32 = target
                .iter()
                .zip(probs.iter())
                .map(|(&t, &p)| -t * (p + 1e-10).ln())
                .sum();
            (ce, &probs * target.sum() - &target)
        }

        fn name(&self) -> &str {
            "CrossEntropy"
        }
    }

    /// Squared error, not linear in the target
    struct Squared;

    impl LossFn for Squared {
        fn sample_loss(
            &self,
            logits: ArrayView1<'_, f32>,
            target: ArrayView1<'_, f32>,
        ) -> (f32, Array1<f32>) {
            let diff = &logits - &target;
            let n = diff.len() as f32;
            (diff.mapv(|d| d * d).sum() / n, diff * (2.0 / n))
        }

        fn name(&self) -> &str {
            "Squared"
        }
    }

    #[test]
    fn test_pair_and_soft_agree_for_linear_loss() {
        let labels = Labels::indices(vec![0, 1, 2], 3).unwrap();
        let ratios = [0.7, 0.2, 1.0];
        let partner = [1, 2, 0];
        let soft = mix_labels(&labels, &ratios, &partner, LabelMode::Soft).unwrap();
        let pair = mix_labels(&labels, &ratios, &partner, LabelMode::Pair).unwrap();
        let logits = arr2(&[[1.0, 0.0, -1.0], [0.5, 0.5, 0.0], [-0.2, 0.1, 2.0]]);

        let s = mixed_loss(&CrossEntropy, &logits, &soft).unwrap();
        let p = mixed_loss(&CrossEntropy, &logits, &pair).unwrap();
        assert_relative_eq!(s.loss, p.loss, epsilon = 1e-5);
        for (x, y) in s.grad.iter().zip(p.grad.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_pair_mode_mixes_losses_not_targets() {
        let labels = Labels::indices(vec![0, 1], 2).unwrap();
        let pair = mix_labels(&labels, &[0.5, 0.5], &[1, 0], LabelMode::Pair).unwrap();
        let logits = arr2(&[[0.5, 0.5], [0.5, 0.5]]);
        let out = mixed_loss(&Squared, &logits, &pair).unwrap();
        assert_relative_eq!(out.loss, 0.25, epsilon = 1e-6);
        let soft = mixed_loss(&Squared, &logits, &MixedLabels::Soft(pair.to_soft())).unwrap();
        assert_relative_eq!(soft.loss, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_is_batch_mean() {
        let labels = MixedLabels::Soft(arr2(&[[1.0, 0.0], [0.0, 1.0]]));
        let logits = arr2(&[[0.0, 0.0], [0.0, 0.0]]);
        let out = mixed_loss(&Squared, &logits, &labels).unwrap();
        // per-sample gradient (-1, 0) and (0, -1), halved by the batch mean
        assert_eq!(out.grad.row(0), arr1(&[-0.5, 0.0]));
        assert_eq!(out.grad.row(1), arr1(&[0.0, -0.5]));
    }

    #[test]
    fn test_shape_and_finiteness_checked() {
        let labels = MixedLabels::Soft(arr2(&[[1.0, 0.0]]));
        let err = mixed_loss(&CrossEntropy, &arr2(&[[0.0, 0.0, 0.0]]), &labels).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let err = mixed_loss(&CrossEntropy, &arr2(&[[f32::NAN, 0.0]]), &labels).unwrap_err();
        assert!(matches!(err, Error::NumericInstability(_)));
    }
}
