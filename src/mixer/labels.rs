//! Label mixing
//!
//! Labels are mixed with the realized ratios. An optional [`RatioRescale`]
//! reshapes those ratios first, and [`LabelMode::TwoHot`] turns the mixed
//! distribution into multi-label targets for sigmoid losses.

use crate::batch::Labels;
use crate::error::{Error, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Tolerance on the row sum of soft targets
pub const DISTRIBUTION_TOLERANCE: f32 = 1e-4;

/// How mixed labels are handed to the loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMode {
    /// `λ·onehot(a) + (1 − λ)·onehot(b)` rows
    #[default]
    Soft,
    /// Both labels plus the per-sample ratio, for hard-label losses
    Pair,
    /// Multi-label rows: the dominant class at 1, the other class scaled
    /// relative to it by `two_hot_scale` and capped at 1
    #[serde(rename = "two_hot")]
    TwoHot,
}

/// Curve applied to label ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RescaleMode {
    #[default]
    None,
    /// Each side's share below `threshold` is raised to `exponent`, then the
    /// two shares are renormalized
    Pow,
}

/// Reshaping of the label ratio before labels are mixed
///
/// Only ratios strictly inside (0, 1) change, so unmixed samples keep
/// their own label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RatioRescale {
    pub mode: RescaleMode,
    pub threshold: f32,
    pub exponent: f32,
    /// Added to the ratio before the curve, result clamped to [0, 1]
    pub bias: f32,
}

impl Default for RatioRescale {
    fn default() -> Self {
        Self {
            mode: RescaleMode::None,
            threshold: 1.0,
            exponent: 1.0,
            bias: 0.0,
        }
    }
}

impl RatioRescale {
    pub fn is_identity(&self) -> bool {
        self.bias == 0.0 && (self.mode == RescaleMode::None || self.exponent == 1.0)
    }

    /// Label ratio for a realized ratio `r`
    pub fn apply(&self, r: f32) -> f32 {
        if r <= 0.0 || r >= 1.0 {
            return r;
        }
        let r = (r + self.bias).clamp(0.0, 1.0);
        match self.mode {
            RescaleMode::None => r,
            RescaleMode::Pow => {
                let side = |x: f32| {
                    if x < self.threshold {
                        x.powf(self.exponent)
                    } else {
                        x
                    }
                };
                let (a, b) = (side(r), side(1.0 - r));
                if a + b > 0.0 {
                    a / (a + b)
                } else {
                    r
                }
            }
        }
    }
}

/// Everything that decides how labels are mixed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelOptions {
    pub mode: LabelMode,
    pub rescale: RatioRescale,
    pub two_hot_scale: f32,
}

impl Default for LabelOptions {
    fn default() -> Self {
        Self {
            mode: LabelMode::Soft,
            rescale: RatioRescale::default(),
            two_hot_scale: 1.0,
        }
    }
}

impl From<LabelMode> for LabelOptions {
    fn from(mode: LabelMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Targets for a mixed batch
#[derive(Debug, Clone, PartialEq)]
pub enum MixedLabels {
    Soft(Array2<f32>),
    Pair {
        label_a: Labels,
        label_b: Labels,
        ratios: Vec<f32>,
    },
    /// Per-class targets in [0, 1]; rows do not sum to one
    TwoHot(Array2<f32>),
}

impl MixedLabels {
    pub fn len(&self) -> usize {
        match self {
            Self::Soft(rows) | Self::TwoHot(rows) => rows.nrows(),
            Self::Pair { ratios, .. } => ratios.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dense (N, K) distributions regardless of mode
    pub fn to_soft(&self) -> Array2<f32> {
        match self {
            Self::Soft(rows) => rows.clone(),
            Self::TwoHot(rows) => {
                let mut out = rows.clone();
                for mut row in out.axis_iter_mut(Axis(0)) {
                    let sum = row.sum();
                    if sum > 0.0 {
                        row /= sum;
                    }
                }
                out
            }
            Self::Pair {
                label_a,
                label_b,
                ratios,
            } => blend_rows(&label_a.to_one_hot(), &label_b.to_one_hot(), ratios),
        }
    }
}

fn blend_rows(a: &Array2<f32>, b: &Array2<f32>, ratios: &[f32]) -> Array2<f32> {
    let mut out = a.clone();
    for ((mut row, b_row), &r) in out.axis_iter_mut(Axis(0)).zip(b.axis_iter(Axis(0))).zip(ratios) {
        row.zip_mut_with(&b_row, |x, &y| *x = r * *x + (1.0 - r) * y);
    }
    out
}

/// Rows must be finite, non-negative and sum to one
///
/// Violations are reported, never clamped.
pub fn check_distribution(rows: &Array2<f32>) -> Result<()> {
    for (i, row) in rows.axis_iter(Axis(0)).enumerate() {
        if row.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericInstability(format!(
                "non-finite soft label in row {i}"
            )));
        }
        if row.iter().any(|&v| v < -DISTRIBUTION_TOLERANCE) {
            return Err(Error::NumericInstability(format!(
                "negative soft label in row {i}"
            )));
        }
        let sum = row.sum();
        if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            return Err(Error::NumericInstability(format!(
                "soft labels in row {i} sum to {sum}"
            )));
        }
    }
    Ok(())
}

fn check_ratios(ratios: &[f32]) -> Result<()> {
    match ratios
        .iter()
        .position(|r| !r.is_finite() || !(0.0..=1.0).contains(r))
    {
        Some(i) => Err(Error::NumericInstability(format!(
            "mixing ratio {} of sample {i} outside [0, 1]",
            ratios[i]
        ))),
        None => Ok(()),
    }
}

/// Dominant class at 1, the rest scaled relative to it and capped at 1
fn two_hot_rows(rows: &Array2<f32>, scale: f32) -> Array2<f32> {
    let mut out = rows.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().fold(0.0f32, |a, &b| a.max(b));
        if max > 0.0 {
            row.mapv_inplace(|v| if v == max { 1.0 } else { (scale * v / max).min(1.0) });
        }
    }
    out
}

/// Mix `labels` with their partners' labels at the given per-sample ratios
///
/// `options` is a [`LabelMode`] or a full [`LabelOptions`]. Ratios pass
/// through the configured rescale before mixing; pair targets carry the
/// rescaled ratios.
pub fn mix_labels(
    labels: &Labels,
    ratios: &[f32],
    partner: &[usize],
    options: impl Into<LabelOptions>,
) -> Result<MixedLabels> {
    let options = options.into();
    let n = labels.len();
    if ratios.len() != n || partner.len() != n {
        return Err(Error::shape(&[n, n], &[ratios.len(), partner.len()]));
    }
    check_ratios(ratios)?;
    let ratios: Vec<f32> = if options.rescale.is_identity() {
        ratios.to_vec()
    } else {
        ratios.iter().map(|&r| options.rescale.apply(r)).collect()
    };
    let label_b = labels.permuted(partner);

    match options.mode {
        LabelMode::Soft => {
            let rows = blend_rows(&labels.to_one_hot(), &label_b.to_one_hot(), &ratios);
            check_distribution(&rows)?;
            Ok(MixedLabels::Soft(rows))
        }
        LabelMode::Pair => Ok(MixedLabels::Pair {
            label_a: labels.clone(),
            label_b,
            ratios,
        }),
        LabelMode::TwoHot => {
            let rows = blend_rows(&labels.to_one_hot(), &label_b.to_one_hot(), &ratios);
            check_distribution(&rows)?;
            Ok(MixedLabels::TwoHot(two_hot_rows(&rows, options.two_hot_scale)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_soft_mix_rows() {
        let labels = Labels::indices(vec![0, 1], 3).unwrap();
        let mixed = mix_labels(&labels, &[0.7, 0.4], &[1, 0], LabelMode::Soft).unwrap();
        let MixedLabels::Soft(rows) = mixed else {
            panic!("expected soft labels");
        };
        assert_abs_diff_eq!(rows[[0, 0]], 0.7);
        assert_abs_diff_eq!(rows[[0, 1]], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(rows[[1, 1]], 0.4);
        assert_abs_diff_eq!(rows[[1, 0]], 0.6, epsilon = 1e-6);
        assert_eq!(rows[[1, 2]], 0.0);
    }

    #[test]
    fn test_same_class_partner_keeps_one_hot() {
        let labels = Labels::indices(vec![2, 2], 3).unwrap();
        let mixed = mix_labels(&labels, &[0.3, 0.9], &[1, 0], LabelMode::Soft).unwrap();
        assert_abs_diff_eq!(mixed.to_soft()[[0, 2]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pair_mode_keeps_both_labels() {
        let labels = Labels::indices(vec![0, 1, 2], 3).unwrap();
        let mixed = mix_labels(&labels, &[0.5, 0.5, 1.0], &[2, 0, 2], LabelMode::Pair).unwrap();
        match &mixed {
            MixedLabels::Pair { label_b, ratios, .. } => {
                assert_eq!(
                    label_b,
                    &Labels::Indices {
                        classes: vec![2, 0, 2],
                        num_classes: 3
                    }
                );
                assert_eq!(ratios, &vec![0.5, 0.5, 1.0]);
            }
            other => panic!("expected pair labels, got {other:?}"),
        }
        assert_abs_diff_eq!(mixed.to_soft()[[0, 2]], 0.5);
    }

    #[test]
    fn test_unnormalized_soft_input_rejected() {
        let labels = Labels::soft(arr2(&[[0.5, 0.6], [1.0, 0.0]]));
        let err = mix_labels(&labels, &[1.0, 1.0], &[0, 1], LabelMode::Soft).unwrap_err();
        assert!(matches!(err, Error::NumericInstability(_)));
    }

    #[test]
    fn test_nan_ratio_rejected() {
        let labels = Labels::indices(vec![0, 1], 2).unwrap();
        let err = mix_labels(&labels, &[f32::NAN, 0.5], &[1, 0], LabelMode::Pair).unwrap_err();
        assert!(matches!(err, Error::NumericInstability(_)));
    }

    #[test]
    fn test_two_hot_rows() {
        let labels = Labels::indices(vec![0, 1, 2], 3).unwrap();
        let options = LabelOptions {
            mode: LabelMode::TwoHot,
            two_hot_scale: 1.0,
            ..Default::default()
        };
        let mixed = mix_labels(&labels, &[0.8, 0.5, 1.0], &[1, 2, 0], options).unwrap();
        let MixedLabels::TwoHot(rows) = &mixed else {
            panic!("expected two-hot labels");
        };
        // 0.8 / 0.2: dominant class at 1, partner at 0.2 / 0.8
        assert_eq!(rows[[0, 0]], 1.0);
        assert_abs_diff_eq!(rows[[0, 1]], 0.25, epsilon = 1e-6);
        // an even split marks both classes
        assert_eq!((rows[[1, 1]], rows[[1, 2]]), (1.0, 1.0));
        // unmixed sample stays one-hot
        assert_eq!(rows.row(2).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_abs_diff_eq!(mixed.to_soft()[[1, 1]], 0.5);
    }

    #[test]
    fn test_two_hot_scale_caps_at_one() {
        let labels = Labels::indices(vec![0, 1], 2).unwrap();
        let options = LabelOptions {
            mode: LabelMode::TwoHot,
            two_hot_scale: 10.0,
            ..Default::default()
        };
        let mixed = mix_labels(&labels, &[0.7, 0.7], &[1, 0], options).unwrap();
        assert_eq!(mixed, MixedLabels::TwoHot(arr2(&[[1.0, 1.0], [1.0, 1.0]])));
    }

    #[test]
    fn test_default_rescale_is_identity() {
        let rescale = RatioRescale::default();
        assert!(rescale.is_identity());
        for r in [0.0, 0.1, 0.5, 0.93, 1.0] {
            assert_eq!(rescale.apply(r), r);
        }
    }

    #[test]
    fn test_pow_rescale_favors_dominant_side() {
        let rescale = RatioRescale {
            mode: RescaleMode::Pow,
            threshold: 1.0,
            exponent: 2.0,
            bias: 0.0,
        };
        // 0.7² / (0.7² + 0.3²)
        assert_abs_diff_eq!(rescale.apply(0.7), 0.49 / 0.58, epsilon = 1e-6);
        assert_abs_diff_eq!(rescale.apply(0.5), 0.5, epsilon = 1e-6);
        assert_eq!(rescale.apply(1.0), 1.0);

        // only the share under the threshold is reshaped
        let thresholded = RatioRescale {
            threshold: 0.5,
            ..rescale
        };
        assert_abs_diff_eq!(thresholded.apply(0.7), 0.7 / 0.79, epsilon = 1e-6);
    }

    #[test]
    fn test_bias_shifts_mixed_samples_only() {
        let rescale = RatioRescale {
            bias: 0.1,
            ..Default::default()
        };
        assert_abs_diff_eq!(rescale.apply(0.3), 0.4, epsilon = 1e-6);
        assert_eq!(rescale.apply(0.95), 1.0);
        assert_eq!(rescale.apply(1.0), 1.0);
        assert_eq!(rescale.apply(0.0), 0.0);
    }

    #[test]
    fn test_rescaled_labels_stay_distributions() {
        let labels = Labels::indices(vec![0, 1, 2], 3).unwrap();
        let options = LabelOptions {
            rescale: RatioRescale {
                mode: RescaleMode::Pow,
                threshold: 0.8,
                exponent: 0.5,
                bias: -0.05,
            },
            ..Default::default()
        };
        let soft = mix_labels(&labels, &[0.2, 0.6, 1.0], &[1, 2, 0], options).unwrap();
        check_distribution(&soft.to_soft()).unwrap();

        let pair = mix_labels(
            &labels,
            &[0.2, 0.6, 1.0],
            &[1, 2, 0],
            LabelOptions {
                mode: LabelMode::Pair,
                ..options
            },
        )
        .unwrap();
        let MixedLabels::Pair { ratios, .. } = pair else {
            panic!("expected pair labels");
        };
        assert_abs_diff_eq!(ratios[0], options.rescale.apply(0.2));
        assert_eq!(ratios[2], 1.0);
    }

    #[test]
    fn test_label_options_yaml() {
        let rescale: RatioRescale =
            serde_yaml::from_str("mode: pow\nexponent: 2.0\n").unwrap();
        assert_eq!(rescale.mode, RescaleMode::Pow);
        assert_eq!(rescale.threshold, 1.0);
        assert!(serde_yaml::from_str::<RatioRescale>("power: 2.0\n").is_err());
        let mode: LabelMode = serde_yaml::from_str("two_hot").unwrap();
        assert_eq!(mode, LabelMode::TwoHot);
    }
}
