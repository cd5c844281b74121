//! Saliency maps and SaliencyMix boxes

use super::cutmix::{box_mask, box_size, centered_box};
use super::{MixMask, RatioSampler};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};

#[derive(Debug, Clone)]
pub struct SaliencyMixParams {
    pub ratio: RatioSampler,
}

const EPS: f32 = 1e-8;

/// Image-gradient saliency of a (C, H, W) image, normalized to sum to one
///
/// Central differences of the channel mean, smoothed with a 3x3 box filter.
pub fn saliency_map(image: ArrayView3<'_, f32>) -> Array2<f32> {
    let gray = image
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array2::zeros((image.dim().1, image.dim().2)));
    let (h, w) = gray.dim();

    let magnitude = Array2::from_shape_fn((h, w), |(y, x)| {
        let gx = (gray[[y, (x + 1).min(w - 1)]] - gray[[y, x.saturating_sub(1)]]) * 0.5;
        let gy = (gray[[(y + 1).min(h - 1), x]] - gray[[y.saturating_sub(1), x]]) * 0.5;
        (gx * gx + gy * gy).sqrt()
    });

    let smoothed = Array2::from_shape_fn((h, w), |(y, x)| {
        let mut sum = 0.0;
        let mut count = 0.0;
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                sum += magnitude[[ny, nx]];
                count += 1.0;
            }
        }
        sum / count + EPS
    });

    normalize(smoothed.view())
}

/// Scale a non-negative map to unit sum; a zero map becomes uniform
pub fn normalize(map: ArrayView2<'_, f32>) -> Array2<f32> {
    let total = map.sum();
    if total > EPS {
        map.mapv(|v| v / total)
    } else {
        Array2::from_elem(map.dim(), 1.0 / map.len().max(1) as f32)
    }
}

/// Row-major position of the largest value, first one on ties
pub fn argmax(map: ArrayView2<'_, f32>) -> (usize, usize) {
    let mut best = ((0, 0), f32::NEG_INFINITY);
    for ((y, x), &v) in map.indexed_iter() {
        if v > best.1 {
            best = ((y, x), v);
        }
    }
    best.0
}

/// CutMix-sized box centered on the partner's saliency peak
pub fn saliencymix_mask(lam: f32, saliency_b: ArrayView2<'_, f32>) -> MixMask {
    let (h, w) = saliency_b.dim();
    let (ch, cw) = box_size(h, w, lam);
    let (cy, cx) = argmax(saliency_b);
    let cut = centered_box(h, w, cy, cx, ch, cw);
    MixMask::Dense(box_mask(h, w, &cut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn test_saliency_sums_to_one() {
        let image = Array3::from_shape_fn((3, 8, 8), |(c, y, x)| ((c + y * x) % 5) as f32);
        let s = saliency_map(image.view());
        assert_abs_diff_eq!(s.sum(), 1.0, epsilon = 1e-4);
        assert!(s.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_flat_image_is_uniform() {
        let s = saliency_map(Array3::from_elem((1, 4, 4), 0.7).view());
        assert!(s.iter().all(|&v| (v - 1.0 / 16.0).abs() < 1e-5));
    }

    #[test]
    fn test_box_follows_peak() {
        let mut sal = Array2::zeros((16, 16));
        sal[[12, 3]] = 1.0;
        let mask = saliencymix_mask(0.75, sal.view());
        assert_eq!(mask.weight(12, 3), 0.0);
        assert_eq!(mask.weight(0, 15), 1.0);
    }
}
