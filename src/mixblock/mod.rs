//! Learned mix block (AutoMix / SAMix)
//!
//! A small per-cell network proposes the mask from pooled features of both
//! images and the requested ratio:
//!
//! ```text
//! features (cells x (2C + 1)) -> W1, b1 -> relu -> W2, b2 -> shift -> sigmoid -> coarse mask
//! ```
//!
//! The shift is the scalar that puts the area-weighted mean of the coarse mask
//! at λ, so the full-resolution mask has the requested ratio no matter what the
//! network has learned; the network only decides where the weight goes. The
//! coarse mask is upsampled to full resolution with nearest neighbours.
//! Each proposal stays on the tape until [`MixBlock::update`] consumes it, so
//! the block trains on the same masks the classifier saw. The block owns its
//! parameters and optimizer; nothing here is shared with the classifier.


use crate::autograd::{add_bias, backward, matmul, relu, shift_to_mean, sigmoid, Tensor};
use crate::error::{Error, Result};
use crate::mask::resample::{avg_pool_channels, cell_of, sum_pool, upsample_nearest};
use crate::mask::RatioSampler;
use crate::optim::{clip_grad_norm, Optimizer};
use ndarray::{Array1, Array2, ArrayView3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ratio sampling for learned policies
#[derive(Debug, Clone)]
pub struct LearnedMixParams {
    pub ratio: RatioSampler,
}

/// When the block takes a gradient step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum UpdateDiscipline {
    /// Every training step
    #[default]
    Simultaneous,
    /// Every `period` steps; proposals from other steps are dropped
    Alternating { period: u64 },
}

/// Runtime configuration of the block
#[derive(Debug, Clone, PartialEq)]
pub struct MixBlockConfig {
    pub in_channels: usize,
    /// Cells per side of the proposal grid
    pub grid: usize,
    pub hidden: usize,
    /// Weight of the classifier's gradient through the mask
    pub classifier_weight: f32,
    /// Weight of the negated classifier gradient (SAMix)
    pub adversarial_weight: f32,
    /// Weight of `(mean(m) - λ)^2`; the shift keeps this near zero, so it
    /// only acts on the bisection residual
    pub ratio_weight: f32,
    /// Weight of the negative mean binary entropy of the mask
    pub entropy_weight: f32,
    pub update: UpdateDiscipline,
    pub max_grad_norm: Option<f32>,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl Default for MixBlockConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            grid: 8,
            hidden: 16,
            classifier_weight: 1.0,
            adversarial_weight: 0.0,
            ratio_weight: 1.0,
            entropy_weight: 0.0,
            update: UpdateDiscipline::Simultaneous,
            max_grad_norm: None,
            seed: 0,
        }
    }
}

/// Output of one forward pass
#[derive(Debug, Clone)]
pub struct BlockForward {
    /// Full-resolution weights of the primary image
    pub mask: Array2<f32>,
    /// Pre-sigmoid cell logits, after the ratio shift
    pub logits: Array1<f32>,
}

/// Training signal for [`MixBlock::update`]
#[derive(Debug, Clone, Default)]
pub struct MixSignal {
    /// dL/d(mask) per batch sample at full resolution; empty when the
    /// classifier provides no input gradient
    pub mask_grads: Vec<Array2<f32>>,
}

/// What an update did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixBlockReport {
    pub updated: bool,
    pub proposals: usize,
    /// Mean `(mean(m) - λ)^2` over proposals, unweighted
    pub ratio_gap: f32,
    /// Mean binary entropy of the proposed masks
    pub entropy: f32,
    /// Parameter gradient norm before clipping
    pub grad_norm: f32,
}

struct Proposal {
    sample: usize,
    cells: Tensor,
    lam: f32,
    /// Cell areas as fractions of the image
    areas: Array1<f32>,
    grid: (usize, usize),
    size: (usize, usize),
}

const ENTROPY_EPS: f32 = 1e-6;

/// Pixel count of each grid cell in row-major cell order
fn cell_areas(gh: usize, gw: usize, h: usize, w: usize) -> Array1<f32> {
    let mut rows = vec![0.0f32; gh];
    let mut cols = vec![0.0f32; gw];
    for y in 0..h {
        rows[cell_of(y, h, gh)] += 1.0;
    }
    for x in 0..w {
        cols[cell_of(x, w, gw)] += 1.0;
    }
    rows.iter()
        .flat_map(|r| cols.iter().map(move |c| r * c))
        .collect()
}

/// Trainable mask generator with its own optimizer
pub struct MixBlock {
    config: MixBlockConfig,
    params: Vec<Tensor>,
    optimizer: Box<dyn Optimizer>,
    pending: Vec<Proposal>,
    updates: u64,
}

impl std::fmt::Debug for MixBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixBlock")
            .field("config", &self.config)
            .field("optimizer", &self.optimizer.name())
            .field("pending", &self.pending.len())
            .field("updates", &self.updates)
            .finish()
    }
}

impl MixBlock {
    /// Build the block with Glorot-uniform weights drawn from `config.seed`
    pub fn new(config: MixBlockConfig, optimizer: Box<dyn Optimizer>) -> Result<Self> {
        if config.in_channels == 0 || config.grid == 0 || config.hidden == 0 {
            return Err(Error::InvalidParameter(
                "mix block channels, grid and hidden must be > 0".to_string(),
            ));
        }
        let fan_in = 2 * config.in_channels + 1;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut glorot = |rows: usize, cols: usize| {
            let limit = (6.0 / (rows + cols) as f32).sqrt();
            let data: Array1<f32> = (0..rows * cols)
                .map(|_| rng.random_range(-limit..limit))
                .collect();
            Tensor::new(data, rows, cols, true)
        };
        let w1 = glorot(fan_in, config.hidden);
        let w2 = glorot(config.hidden, 1);
        let params = vec![
            w1,
            Tensor::zeros(1, config.hidden, true),
            w2,
            Tensor::zeros(1, 1, true),
        ];

        Ok(Self {
            config,
            params,
            optimizer,
            pending: Vec::new(),
            updates: 0,
        })
    }

    pub fn config(&self) -> &MixBlockConfig {
        &self.config
    }

    /// Trainable parameters `[W1, b1, W2, b2]`
    pub fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    /// Mutable parameters, e.g. for restoring a checkpoint
    pub fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut self.params
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Gradient steps taken so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Proposals waiting for a training signal
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop proposals without training on them
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Whether the block trains at progress `step`
    pub fn should_update(&self, step: u64) -> bool {
        match self.config.update {
            UpdateDiscipline::Simultaneous => true,
            UpdateDiscipline::Alternating { period } => step % period.max(1) == 0,
        }
    }

    fn grid_for(&self, h: usize, w: usize) -> (usize, usize) {
        (self.config.grid.min(h).max(1), self.config.grid.min(w).max(1))
    }

    /// Propose a mask for (a, b) at ratio `lam`
    ///
    /// `sample` is the batch position of `a`; the proposal is kept until the
    /// next update or discard.
    pub fn forward(
        &mut self,
        sample: usize,
        a: ArrayView3<'_, f32>,
        b: ArrayView3<'_, f32>,
        lam: f32,
    ) -> Result<BlockForward> {
        let (c, h, w) = a.dim();
        if c != self.config.in_channels {
            return Err(Error::shape(&[self.config.in_channels, h, w], &[c, h, w]));
        }
        if b.dim() != a.dim() {
            let (bc, bh, bw) = b.dim();
            return Err(Error::shape(&[c, h, w], &[bc, bh, bw]));
        }

        let (gh, gw) = self.grid_for(h, w);
        let pooled_a = avg_pool_channels(a, gh, gw);
        let pooled_b = avg_pool_channels(b, gh, gw);
        let width = 2 * c + 1;
        let cells = gh * gw;

        let mut features = Vec::with_capacity(cells * width);
        for y in 0..gh {
            for x in 0..gw {
                features.extend((0..c).map(|ch| pooled_a[[ch, y, x]]));
                features.extend((0..c).map(|ch| pooled_b[[ch, y, x]]));
                features.push(lam);
            }
        }
        let input = Tensor::new(Array1::from(features), cells, width, false);

        let [w1, b1, w2, b2] = &self.params[..] else {
            return Err(Error::InvalidParameter(
                "mix block expects four parameter tensors".to_string(),
            ));
        };
        let hidden = relu(&add_bias(&matmul(&input, w1), b1));
        let raw = add_bias(&matmul(&hidden, w2), b2);
        let areas = cell_areas(gh, gw, h, w) / (h * w) as f32;
        let logits = shift_to_mean(&raw, lam, &areas);
        let out = sigmoid(&logits);

        let coarse = Array2::from_shape_vec((gh, gw), out.data().to_vec())
            .map_err(|_| Error::shape(&[cells], &[out.len()]))?;
        let mask = upsample_nearest(coarse.view(), h, w);
        let logits = logits.data().clone();

        self.pending.push(Proposal {
            sample,
            cells: out,
            lam,
            areas,
            grid: (gh, gw),
            size: (h, w),
        });

        Ok(BlockForward { mask, logits })
    }

    /// One gradient step on every pending proposal
    ///
    /// The loss per proposal is the classifier term (weighted by
    /// `classifier_weight - adversarial_weight`), the ratio term and the
    /// entropy term; proposals are averaged. Pending proposals are consumed
    /// even when the step fails.
    pub fn update(&mut self, signal: &MixSignal) -> Result<MixBlockReport> {
        let proposals = std::mem::take(&mut self.pending);
        if proposals.is_empty() {
            return Ok(MixBlockReport::default());
        }

        let scale = 1.0 / proposals.len() as f32;
        let cls_weight = self.config.classifier_weight - self.config.adversarial_weight;
        let mut ratio_gap = 0.0;
        let mut entropy = 0.0;

        for proposal in &proposals {
            let (gh, gw) = proposal.grid;
            let cells = (gh * gw) as f32;
            let m = proposal.cells.data();

            let mut grad = match signal.mask_grads.get(proposal.sample) {
                Some(g) if g.dim() == proposal.size => {
                    let pooled = sum_pool(g.view(), gh, gw);
                    Array1::from_iter(pooled.iter().map(|v| v * cls_weight))
                }
                Some(g) => {
                    let (h, w) = proposal.size;
                    return Err(Error::shape(&[h, w], &[g.nrows(), g.ncols()]));
                }
                None if signal.mask_grads.is_empty() => Array1::zeros(m.len()),
                None => {
                    return Err(Error::shape(
                        &[proposal.sample + 1],
                        &[signal.mask_grads.len()],
                    ))
                }
            };

            let mean = (m * &proposal.areas).sum();
            let gap = mean - proposal.lam;
            ratio_gap += gap * gap;
            let ratio_grad = self.config.ratio_weight * 2.0 * gap;

            let ew = self.config.entropy_weight;
            for ((g, &v), &area) in grad.iter_mut().zip(m.iter()).zip(&proposal.areas) {
                let v = v.clamp(ENTROPY_EPS, 1.0 - ENTROPY_EPS);
                entropy -= (v * v.ln() + (1.0 - v) * (1.0 - v).ln()) / cells;
                *g += ratio_grad * area - ew * ((1.0 - v) / v).ln() / cells;
            }

            let mut out = proposal.cells.clone();
            backward(&mut out, Some(grad * scale));
        }

        let grad_norm = match self.config.max_grad_norm {
            Some(max_norm) => clip_grad_norm(&mut self.params, max_norm),
            None => self
                .params
                .iter()
                .map(|p| p.grad_norm().powi(2))
                .sum::<f32>()
                .sqrt(),
        };

        let stepped = self.optimizer.step(&mut self.params);
        self.optimizer.zero_grad(&mut self.params);
        stepped?;
        self.updates += 1;

        let report = MixBlockReport {
            updated: true,
            proposals: proposals.len(),
            ratio_gap: ratio_gap * scale,
            entropy: entropy * scale,
            grad_norm,
        };
        debug!(
            proposals = report.proposals,
            ratio_gap = report.ratio_gap,
            grad_norm = report.grad_norm,
            optimizer = self.optimizer.name(),
            "mix block updated"
        );
        Ok(report)
    }
}
