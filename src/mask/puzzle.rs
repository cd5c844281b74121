//! Saliency-guided masks (PuzzleMix)
//!
//! Each cell of a coarse grid is assigned to `a` or `b` so that as much total
//! saliency as possible survives and neighbouring cells prefer the same
//! source. The pixels kept from `a` come within half the largest cell of
//! `lam * h * w`; cells differ in size when the grid does not divide the
//! image.

use super::graphcut::{labeling_energy, solve_grid_labeling};
use super::resample::{cell_of, sum_pool, upsample_nearest};
use super::saliency::normalize;
use super::{MixMask, RatioSampler};
use ndarray::{Array2, ArrayView2};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct PuzzleMixParams {
    pub ratio: RatioSampler,
    /// Cells per side of the labeling grid
    pub grid: usize,
    /// Potts smoothness relative to the mean cell saliency
    pub beta: f32,
    /// Augmenting-path budget of each min-cut solve
    pub max_flow_augmentations: usize,
    /// Bisection steps on the area multiplier
    pub max_bisection_iters: usize,
}

#[derive(Debug, Clone)]
pub struct PuzzleOutcome {
    pub mask: MixMask,
    /// Coarse labels, `true` keeps `a`
    pub cells: Array2<bool>,
    /// A min-cut solve stopped on its augmentation budget
    pub exhausted: bool,
}

/// Unary costs of both labels plus the smoothness weight for pooled saliency
struct Energy {
    cost0: Vec<f32>,
    cost1: Vec<f32>,
    beta: f32,
    gh: usize,
    gw: usize,
}

impl Energy {
    fn new(pa: &Array2<f32>, pb: &Array2<f32>, beta: f32) -> Self {
        let (gh, gw) = pa.dim();
        let n = (gh * gw) as f32;
        Self {
            // label 0 drops a's saliency, label 1 drops b's
            cost0: pa.iter().copied().collect(),
            cost1: pb.iter().copied().collect(),
            beta: beta / n,
            gh,
            gw,
        }
    }

    fn cells(&self) -> usize {
        self.gh * self.gw
    }

    /// Energy change from flipping cell `i`
    fn flip_delta(&self, labels: &[bool], i: usize) -> f32 {
        let unary = if labels[i] {
            self.cost0[i] - self.cost1[i]
        } else {
            self.cost1[i] - self.cost0[i]
        };
        let (y, x) = (i / self.gw, i % self.gw);
        let mut neighbours = Vec::with_capacity(4);
        if x > 0 {
            neighbours.push(i - 1);
        }
        if x + 1 < self.gw {
            neighbours.push(i + 1);
        }
        if y > 0 {
            neighbours.push(i - self.gw);
        }
        if y + 1 < self.gh {
            neighbours.push(i + self.gw);
        }
        let pairwise: f32 = neighbours
            .iter()
            .map(|&j| {
                // differing before the flip becomes agreeing after, and vice versa
                if labels[j] == labels[i] {
                    self.beta
                } else {
                    -self.beta
                }
            })
            .sum();
        unary + pairwise
    }
}

/// Pixels per grid cell in row-major order, as laid out by `upsample_nearest`
fn cell_areas(h: usize, w: usize, gh: usize, gw: usize) -> Vec<usize> {
    let mut rows = vec![0; gh];
    for y in 0..h {
        rows[cell_of(y, h, gh)] += 1;
    }
    let mut cols = vec![0; gw];
    for x in 0..w {
        cols[cell_of(x, w, gw)] += 1;
    }
    (0..gh * gw).map(|i| rows[i / gw] * cols[i % gw]).collect()
}

fn kept_area(labels: &[bool], areas: &[usize]) -> usize {
    labels
        .iter()
        .zip(areas)
        .filter(|&(&keep, _)| keep)
        .map(|(_, &a)| a)
        .sum()
}

/// Flip the cheapest cells while each flip brings the kept area closer to
/// `target`
fn repair_to_area(labels: &mut [bool], energy: &Energy, areas: &[usize], target: usize) {
    loop {
        let area = kept_area(labels, areas);
        let gap = area.abs_diff(target);
        let from = area > target;
        let pick = (0..labels.len())
            .filter(|&i| labels[i] == from)
            .filter(|&i| {
                let next = if from { area - areas[i] } else { area + areas[i] };
                next.abs_diff(target) < gap
            })
            .map(|i| (i, energy.flip_delta(labels, i)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        match pick {
            Some((i, _)) => labels[i] = !from,
            None => return,
        }
    }
}

/// Labeling with a Lagrange bias `mu` added to the cost of keeping `a`
fn solve_biased(energy: &Energy, mu: f32, budget: usize) -> (Vec<bool>, bool) {
    let biased: Vec<f32> = energy.cost1.iter().map(|c| c + mu).collect();
    let cut = solve_grid_labeling(
        &energy.cost0,
        &biased,
        energy.gh,
        energy.gw,
        energy.beta,
        budget,
    );
    (cut.labels, cut.exhausted)
}

/// PuzzleMix mask for ratio `lam` from the saliency of both images
pub fn puzzle_mask(
    saliency_a: ArrayView2<'_, f32>,
    saliency_b: ArrayView2<'_, f32>,
    lam: f32,
    params: &PuzzleMixParams,
) -> PuzzleOutcome {
    let (h, w) = saliency_a.dim();
    let gh = params.grid.clamp(1, h.max(1));
    let gw = params.grid.clamp(1, w.max(1));

    let pa = sum_pool(normalize(saliency_a).view(), gh, gw);
    let pb = sum_pool(normalize(saliency_b).view(), gh, gw);
    let energy = Energy::new(&pa, &pb, params.beta);
    let n = energy.cells();
    let areas = cell_areas(h, w, gh, gw);
    let total = h * w;
    let target = ((lam.clamp(0.0, 1.0) * total as f32).round() as usize).min(total);
    let tolerance = areas.iter().copied().max().unwrap_or(0) / 2;

    let mut exhausted = false;
    let labels = if target == 0 || target == total {
        vec![target == total; n]
    } else {
        let (mut best, hit) = solve_biased(&energy, 0.0, params.max_flow_augmentations);
        exhausted |= hit;
        let mut best_gap = kept_area(&best, &areas).abs_diff(target);

        // mu = -bound keeps every cell on a, +bound keeps none
        let bound = 2.0 + 8.0 * energy.beta;
        let (mut lo, mut hi) = (-bound, bound);
        let mut iters = 0;
        while best_gap > tolerance && iters < params.max_bisection_iters && hi - lo > 1e-7 {
            let mu = 0.5 * (lo + hi);
            let (labels, hit) = solve_biased(&energy, mu, params.max_flow_augmentations);
            exhausted |= hit;
            let area = kept_area(&labels, &areas);
            if area.abs_diff(target) < best_gap {
                best_gap = area.abs_diff(target);
                best = labels;
            }
            if area > target {
                lo = mu;
            } else {
                hi = mu;
            }
            iters += 1;
        }
        trace!(iters, gap = best_gap, "puzzle bisection finished");

        repair_to_area(&mut best, &energy, &areas, target);
        best
    };

    let cells = Array2::from_shape_fn((gh, gw), |(y, x)| labels[y * gw + x]);
    let coarse = cells.mapv(|keep| if keep { 1.0 } else { 0.0 });
    PuzzleOutcome {
        mask: MixMask::Dense(upsample_nearest(coarse.view(), h, w)),
        cells,
        exhausted,
    }
}

/// Energy of a coarse labeling, exposed for diagnostics and tests
pub fn puzzle_energy(
    saliency_a: ArrayView2<'_, f32>,
    saliency_b: ArrayView2<'_, f32>,
    cells: &Array2<bool>,
    beta: f32,
) -> f32 {
    let (gh, gw) = cells.dim();
    let pa = sum_pool(normalize(saliency_a).view(), gh, gw);
    let pb = sum_pool(normalize(saliency_b).view(), gh, gw);
    let energy = Energy::new(&pa, &pb, beta);
    let labels: Vec<bool> = cells.iter().copied().collect();
    labeling_energy(&labels, &energy.cost0, &energy.cost1, gh, gw, energy.beta)
}
