//! Fourier masks (FMix)
//!
//! Low-frequency noise is sampled in the frequency domain, brought back with an
//! inverse 2-D FFT and thresholded so that a `lam` share of pixels keeps the
//! primary image.

use super::{MixMask, RatioSampler};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

#[derive(Debug, Clone)]
pub struct FMixParams {
    pub ratio: RatioSampler,
    /// Spectrum decays as 1 / f^decay_power
    pub decay_power: f32,
    /// Width of the soft band around the boundary, 0 gives a binary mask
    pub max_soft: f32,
    /// Ratio drawn from Beta(α + 1, α) instead of Beta(α, α)
    pub reformulate: bool,
    /// Bisection steps for the threshold search
    pub threshold_iters: usize,
}

/// Result of one FMix draw
#[derive(Debug, Clone)]
pub struct FMixOutcome {
    pub mask: MixMask,
    /// Whether the threshold hit the target pixel count exactly
    pub converged: bool,
}

/// Sample-frequency magnitudes in the layout of an unshifted FFT
fn frequency_grid(h: usize, w: usize) -> Array2<f32> {
    let freq = |i: usize, n: usize| {
        let k = if i <= n / 2 { i as f32 } else { i as f32 - n as f32 };
        k / n as f32
    };
    Array2::from_shape_fn((h, w), |(y, x)| {
        let fy = freq(y, h);
        let fx = freq(x, w);
        (fy * fy + fx * fx).sqrt()
    })
}

/// Inverse 2-D FFT in place over a row-major (h, w) buffer
fn ifft2(buffer: &mut [Complex32], h: usize, w: usize) {
    let mut planner = FftPlanner::<f32>::new();

    planner.plan_fft_inverse(w).process(buffer);

    let mut transposed = vec![Complex32::new(0.0, 0.0); h * w];
    for y in 0..h {
        for x in 0..w {
            transposed[x * h + y] = buffer[y * w + x];
        }
    }
    planner.plan_fft_inverse(h).process(&mut transposed);
    for y in 0..h {
        for x in 0..w {
            buffer[y * w + x] = transposed[x * h + y];
        }
    }
}

/// Real-valued low-frequency noise of shape (h, w)
pub fn low_frequency_noise<R: Rng + ?Sized>(
    h: usize,
    w: usize,
    decay_power: f32,
    rng: &mut R,
) -> Array2<f32> {
    let floor = 1.0 / h.max(w) as f32;
    let freqs = frequency_grid(h, w);

    let mut spectrum: Vec<Complex32> = freqs
        .iter()
        .map(|&f| {
            let scale = 1.0 / f.max(floor).powf(decay_power);
            let re: f32 = StandardNormal.sample(rng);
            let im: f32 = StandardNormal.sample(rng);
            Complex32::new(re * scale, im * scale)
        })
        .collect();

    ifft2(&mut spectrum, h, w);
    Array2::from_shape_vec((h, w), spectrum.into_iter().map(|c| c.re).collect())
        .unwrap_or_else(|_| Array2::zeros((h, w)))
}

/// Binary mask keeping `a` on the `target` highest noise values
///
/// Bisection over the threshold for at most `iters` steps; when no threshold
/// yields exactly `target` pixels the closest count found is used.
fn threshold_mask(noise: &Array2<f32>, target: usize, iters: usize) -> (Array2<f32>, bool) {
    let count_above = |t: f32| noise.iter().filter(|&&v| v > t).count();

    let lo_init = noise.iter().copied().fold(f32::INFINITY, f32::min);
    let hi_init = noise.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    // everything above lo - 1, nothing above hi
    let mut lo = lo_init - 1.0;
    let mut hi = hi_init;
    let mut best = (lo, count_above(lo).abs_diff(target));

    for _ in 0..iters {
        if best.1 == 0 {
            break;
        }
        let mid = 0.5 * (lo + hi);
        let count = count_above(mid);
        let diff = count.abs_diff(target);
        if diff < best.1 {
            best = (mid, diff);
        }
        if count > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    if count_above(hi).abs_diff(target) < best.1 {
        best = (hi, count_above(hi).abs_diff(target));
    }

    let (t, diff) = best;
    (noise.mapv(|v| if v > t { 1.0 } else { 0.0 }), diff == 0)
}

/// Ranked mask with a linear soft band of half-width `soft` pixels
fn soft_mask(noise: &Array2<f32>, target: usize, soft: usize) -> Array2<f32> {
    let n = noise.len();
    let mut order: Vec<usize> = (0..n).collect();
    let flat: Vec<f32> = noise.iter().copied().collect();
    order.sort_by(|&i, &j| flat[j].total_cmp(&flat[i]).then(i.cmp(&j)));

    let low = target.saturating_sub(soft);
    let high = (target + soft).min(n);
    let band = high - low;

    let mut values = vec![0.0f32; n];
    for (rank, &idx) in order.iter().enumerate() {
        values[idx] = if rank < low {
            1.0
        } else if rank >= high {
            0.0
        } else if band > 1 {
            1.0 - (rank - low) as f32 / (band - 1) as f32
        } else {
            0.5
        };
    }
    Array2::from_shape_vec(noise.dim(), values).unwrap_or_else(|_| Array2::zeros(noise.dim()))
}

/// FMix mask for ratio `lam` on an (h, w) image
pub fn fmix_mask<R: Rng + ?Sized>(
    h: usize,
    w: usize,
    lam: f32,
    params: &FMixParams,
    rng: &mut R,
) -> FMixOutcome {
    let noise = low_frequency_noise(h, w, params.decay_power, rng);
    let n = h * w;
    let target = ((lam.clamp(0.0, 1.0) * n as f32).round() as usize).min(n);

    let eff_soft = params.max_soft.min(lam).min(1.0 - lam).max(0.0);
    let soft = (n as f32 * eff_soft).round() as usize;

    if soft > 0 {
        FMixOutcome {
            mask: MixMask::Dense(soft_mask(&noise, target, soft)),
            converged: true,
        }
    } else {
        let (mask, converged) = threshold_mask(&noise, target, params.threshold_iters);
        FMixOutcome {
            mask: MixMask::Dense(mask),
            converged,
        }
    }
}
