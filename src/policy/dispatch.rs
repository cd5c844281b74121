//! Per-batch policy selection and mask dispatch

use super::{MixPolicy, PolicyId, SwitchSchedule};
use crate::batch::ImageBatch;
use crate::error::{Error, Result};
use crate::mask::{saliency_map, PairMix, PairRequest};
use crate::metadata::MixMetadata;
use crate::mixblock::MixBlock;
use crate::mixer::{self, LabelMode, LabelOptions, MixOutput};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SELECT_STREAM: u64 = 1;
const MIX_STREAM: u64 = 2;

/// Generator for `stream` at batch `index` of a run seeded with `seed`
///
/// Streams are independent, so switching how policies are selected never
/// shifts the masks drawn for a batch.
pub fn step_rng(seed: u64, index: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    rng.set_stream(stream);
    rng
}

/// How partners are chosen within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    /// Random permutation of the batch
    #[default]
    Shuffle,
    /// (0, 1), (2, 3), ...
    Adjacent,
}

/// Partner of the last sample of an odd batch under adjacent pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OddSample {
    /// Pair with sample 0
    #[default]
    Wrap,
    /// Pair with itself
    #[serde(rename = "self")]
    SelfPair,
    /// Leave unmixed
    Skip,
}

impl PairingMode {
    /// Partner indices and which samples stay unmixed
    pub fn partners<R: Rng + ?Sized>(
        &self,
        n: usize,
        odd: OddSample,
        rng: &mut R,
    ) -> (Vec<usize>, Vec<bool>) {
        let mut skip = vec![false; n];
        let partner = match self {
            Self::Shuffle => {
                let mut perm: Vec<usize> = (0..n).collect();
                perm.shuffle(rng);
                perm
            }
            Self::Adjacent => {
                let mut partner: Vec<usize> = (0..n).map(|i| i ^ 1).collect();
                if n % 2 == 1 {
                    let last = n - 1;
                    partner[last] = match odd {
                        OddSample::Wrap => 0,
                        OddSample::SelfPair => last,
                        OddSample::Skip => {
                            skip[last] = true;
                            last
                        }
                    };
                }
                partner
            }
        };
        (partner, skip)
    }
}

/// One configured policy in the pool
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Name as written in the configuration
    pub name: String,
    pub policy: MixPolicy,
}

/// Selects a policy per batch and produces the mixed batch
///
/// Owns the run-scoped progress counter and, when a learned policy is in
/// the pool, the mix block.
pub struct MixDispatcher {
    pool: Vec<PoolEntry>,
    schedule: Box<dyn SwitchSchedule>,
    seed: u64,
    step: u64,
    pairing: PairingMode,
    odd_sample: OddSample,
    labels: LabelOptions,
    strict_budget: bool,
    mix_block: Option<MixBlock>,
}

impl std::fmt::Debug for MixDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixDispatcher")
            .field("pool", &self.pool.iter().map(|e| &e.name).collect::<Vec<_>>())
            .field("schedule", &self.schedule.name())
            .field("seed", &self.seed)
            .field("step", &self.step)
            .field("mix_block", &self.mix_block)
            .finish()
    }
}

impl MixDispatcher {
    /// Dispatcher over `pool`; the schedule must yield one weight per entry
    pub fn new(pool: Vec<PoolEntry>, schedule: Box<dyn SwitchSchedule>, seed: u64) -> Result<Self> {
        if pool.is_empty() {
            return Err(Error::ConfigError("policy pool is empty".to_string()));
        }
        let weights = schedule.weights(0);
        if weights.len() != pool.len() {
            return Err(Error::ConfigError(format!(
                "schedule '{}' yields {} weights for {} policies",
                schedule.name(),
                weights.len(),
                pool.len()
            )));
        }
        Ok(Self {
            pool,
            schedule,
            seed,
            step: 0,
            pairing: PairingMode::default(),
            odd_sample: OddSample::default(),
            labels: LabelOptions::default(),
            strict_budget: false,
            mix_block: None,
        })
    }

    pub fn with_pairing(mut self, pairing: PairingMode, odd_sample: OddSample) -> Self {
        self.pairing = pairing;
        self.odd_sample = odd_sample;
        self
    }

    /// Label mode together with ratio rescaling and two-hot scale
    pub fn with_label_options(mut self, options: LabelOptions) -> Self {
        self.labels = options;
        self
    }

    /// Turn budget exhaustion into an error instead of a warning
    pub fn with_strict_budget(mut self, strict: bool) -> Self {
        self.strict_budget = strict;
        self
    }

    pub fn with_mix_block(mut self, block: MixBlock) -> Self {
        self.mix_block = Some(block);
        self
    }

    pub fn pool(&self) -> &[PoolEntry] {
        &self.pool
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Dispatches performed since the last reset
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn label_mode(&self) -> LabelMode {
        self.labels.mode
    }

    pub fn label_options(&self) -> LabelOptions {
        self.labels
    }

    pub fn mix_block(&self) -> Option<&MixBlock> {
        self.mix_block.as_ref()
    }

    pub fn mix_block_mut(&mut self) -> Option<&mut MixBlock> {
        self.mix_block.as_mut()
    }

    /// Start a new run: progress back to zero, pending proposals dropped
    pub fn reset(&mut self) {
        self.step = 0;
        if let Some(block) = self.mix_block.as_mut() {
            block.discard_pending();
        }
    }

    /// Current pool weights
    pub fn weights(&self) -> Vec<f32> {
        self.schedule.weights(self.step)
    }

    /// Policy for batch `batch_index`
    ///
    /// Uses its own random stream, weighted by the schedule at the current
    /// progress.
    pub fn select_policy(&self, batch_index: u64) -> PolicyId {
        if self.pool.len() == 1 {
            return self.pool[0].policy.id();
        }
        let weights = self.schedule.weights(self.step);
        let mut rng = step_rng(self.seed, batch_index, SELECT_STREAM);
        let u: f32 = rng.random();
        self.pool[super::draw_index(&weights, u)].policy.id()
    }

    /// Select and dispatch the next batch
    pub fn next(&mut self, batch: &ImageBatch) -> Result<MixOutput> {
        let policy = self.select_policy(self.step);
        self.dispatch(policy, batch)
    }

    /// Mix `batch` with `policy_id`
    ///
    /// Draw order within the step: ratio, partner permutation, feature
    /// layer, then each pair's placement in batch order. The progress counter
    /// advances only on success.
    pub fn dispatch(&mut self, policy_id: PolicyId, batch: &ImageBatch) -> Result<MixOutput> {
        let entry = self
            .pool
            .iter()
            .find(|e| e.policy.id() == policy_id)
            .ok_or_else(|| {
                Error::ConfigError(format!("policy {policy_id} is not in the configured pool"))
            })?;
        let policy = &entry.policy;

        let mut rng = step_rng(self.seed, self.step, MIX_STREAM);
        let n = batch.len();
        let (_, h, w) = batch.image_dims();

        let lam = policy.draw_ratio(&mut rng);
        let (partner, skip) = self.pairing.partners(n, self.odd_sample, &mut rng);
        let feature_layer = policy.draw_feature_layer(&mut rng);

        let saliency: Option<Vec<Array2<f32>>> =
            if policy_id.needs_saliency() && !batch.has_saliency() {
                Some((0..n).map(|i| saliency_map(batch.image(i))).collect())
            } else {
                None
            };
        let saliency_of = |i: usize| match &saliency {
            Some(maps) => Some(maps[i].view()),
            None => batch.saliency(i),
        };

        if let Some(block) = self.mix_block.as_mut() {
            block.discard_pending();
        }

        let mut pairs: Vec<PairMix> = Vec::with_capacity(n);
        for i in 0..n {
            if skip[i] {
                pairs.push(PairMix::identity());
                continue;
            }
            let j = partner[i];
            let req = PairRequest {
                index: i,
                a: batch.image(i),
                b: batch.image(j),
                saliency_a: saliency_of(i),
                saliency_b: saliency_of(j),
                ratio: lam,
            };
            let mix = policy.generate_pair(&req, &mut rng, self.mix_block.as_mut())?;
            mix.mask.check_shape(h, w)?;
            pairs.push(mix);
        }

        let exhausted = pairs.iter().filter(|p| p.exhausted).count();
        if exhausted > 0 {
            if self.strict_budget {
                return Err(Error::OptimizationBudgetExceeded { samples: exhausted });
            }
            warn!(
                policy = %policy_id,
                step = self.step,
                samples = exhausted,
                "mask optimization budget exhausted, using best partition found"
            );
        }

        let block_logits = policy_id.is_learned().then(|| {
            pairs
                .iter()
                .map(|p| p.logits.clone().unwrap_or_default())
                .collect()
        });
        let (masks, transforms): (Vec<_>, Vec<_>) =
            pairs.into_iter().map(|p| (p.mask, p.transform)).unzip();

        let metadata = MixMetadata {
            policy: policy_id,
            step: self.step,
            requested_ratio: lam,
            ratios: Vec::new(),
            masks,
            partner,
            transforms,
            block_logits,
            feature_layer,
            alignment: policy.alignment(),
            budget_exhausted: exhausted > 0,
        };
        let output = mixer::mix(batch, metadata, self.labels)?;

        debug!(
            policy = %policy_id,
            name = %entry.name,
            step = self.step,
            requested_ratio = lam,
            mean_ratio = output.metadata.mean_ratio(),
            "dispatched batch"
        );
        self.step += 1;
        Ok(output)
    }
}
