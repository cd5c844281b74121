//! Build runtime components from configuration

use super::schema::{MixBlockSpec, MixSpec, OptimSpec, PolicySpec, SwitchMode};
use super::validate::{registry_for, validate_config, ValidationError};
use crate::error::{Error, Result};
use crate::mask::{
    AlignMixParams, Alignment, BoxPlacement, CutMixParams, FMixParams, ManifoldMixParams,
    MixupParams, PuzzleMixParams, RatioSampler, ResizeMixParams, SaliencyMixParams,
};
use crate::mixblock::{LearnedMixParams, MixBlock, MixBlockConfig};
use crate::mixer::LabelOptions;
use crate::optim::{Adam, Optimizer, SGD};
use crate::policy::{
    FixedSwitch, LinearSwitch, MixDispatcher, MixPolicy, PolicyId, PoolEntry, RandomSwitch,
    SwitchSchedule,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Build optimizer from configuration
pub fn build_optimizer(spec: &OptimSpec) -> Result<Box<dyn Optimizer>> {
    let get = |key: &str, default: f64| {
        spec.params
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default) as f32
    };

    match spec.name.to_lowercase().as_str() {
        "sgd" => {
            let momentum = get("momentum", 0.0);
            let weight_decay = get("weight_decay", 0.0);
            Ok(Box::new(
                SGD::new(spec.lr, momentum).with_weight_decay(weight_decay),
            ))
        }
        "adam" => {
            let beta1 = get("beta1", 0.9);
            let beta2 = get("beta2", 0.999);
            let eps = get("eps", 1e-8);
            Ok(Box::new(Adam::new(spec.lr, beta1, beta2, eps)))
        }
        name => Err(Error::ConfigError(format!(
            "Unknown optimizer: {}. Supported: sgd, adam",
            name
        ))),
    }
}

// =============================================================================
// Policy hyperparameters
// =============================================================================

/// Typed access to a policy's free-form parameters
struct ParamReader<'a> {
    policy: &'a str,
    params: &'a HashMap<String, Value>,
}

impl<'a> ParamReader<'a> {
    fn invalid(&self, key: &str, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidValue {
            policy: self.policy.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    fn f32(&self, key: &str, default: f32) -> std::result::Result<f32, ValidationError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .map(|x| x as f32)
                .filter(|x| x.is_finite())
                .ok_or_else(|| self.invalid(key, format!("expected a number, got {v}"))),
        }
    }

    fn positive(&self, key: &str, default: f32) -> std::result::Result<f32, ValidationError> {
        let x = self.f32(key, default)?;
        if x <= 0.0 {
            return Err(self.invalid(key, format!("{x} must be > 0")));
        }
        Ok(x)
    }

    fn usize(&self, key: &str, default: usize) -> std::result::Result<usize, ValidationError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .map(|x| x as usize)
                .ok_or_else(|| {
                    self.invalid(key, format!("expected a non-negative integer, got {v}"))
                }),
        }
    }

    fn bool(&self, key: &str, default: bool) -> std::result::Result<bool, ValidationError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| self.invalid(key, format!("expected true or false, got {v}"))),
        }
    }

    fn str(&self, key: &str) -> std::result::Result<Option<&'a str>, ValidationError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid(key, format!("expected a string, got {v}"))),
        }
    }

    /// `[lo, hi]` with `lo <= hi`
    fn range(&self, key: &str) -> std::result::Result<Option<(f64, f64)>, ValidationError> {
        let Some(v) = self.params.get(key) else {
            return Ok(None);
        };
        let pair = v
            .as_array()
            .filter(|a| a.len() == 2)
            .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
            .ok_or_else(|| self.invalid(key, format!("expected [lo, hi], got {v}")))?;
        if pair.0 > pair.1 {
            return Err(self.invalid(key, format!("lo {} exceeds hi {}", pair.0, pair.1)));
        }
        Ok(Some(pair))
    }

    /// Beta(α, α) sampler clamped to `ratio_bounds` when given
    fn ratio(&self) -> std::result::Result<RatioSampler, ValidationError> {
        self.ratio_with(|alpha| (alpha, alpha))
    }

    fn ratio_with(
        &self,
        shape: impl Fn(f32) -> (f32, f32),
    ) -> std::result::Result<RatioSampler, ValidationError> {
        let alpha = self.positive("alpha", 1.0)?;
        let (a, b) = shape(alpha);
        let sampler =
            RatioSampler::new(a, b).map_err(|e| self.invalid("alpha", e.to_string()))?;
        match self.range("ratio_bounds")? {
            None => Ok(sampler),
            Some((lo, hi)) => sampler
                .with_bounds(lo as f32, hi as f32)
                .map_err(|e| self.invalid("ratio_bounds", e.to_string())),
        }
    }

    /// Inclusive hidden-layer index range, `[0, 2]` when absent
    fn layers(&self) -> std::result::Result<(usize, usize), ValidationError> {
        let layers = self.range("layers")?.unwrap_or((0.0, 2.0));
        if layers.0 < 0.0 || layers.0.fract() != 0.0 || layers.1.fract() != 0.0 {
            return Err(self.invalid("layers", "expected [lo, hi] layer indices"));
        }
        Ok((layers.0 as usize, layers.1 as usize))
    }

    fn placement(&self) -> std::result::Result<BoxPlacement, ValidationError> {
        match self.str("placement")? {
            None => Ok(BoxPlacement::default()),
            Some(s) => s
                .parse::<BoxPlacement>()
                .map_err(|e| self.invalid("placement", e.to_string())),
        }
    }
}

/// Runtime policy for one validated pool entry
pub(crate) fn policy_from_spec(
    id: PolicyId,
    name: &str,
    spec: &PolicySpec,
) -> std::result::Result<MixPolicy, ValidationError> {
    let p = ParamReader {
        policy: name,
        params: &spec.params,
    };
    let policy = match id {
        PolicyId::Identity => MixPolicy::Identity,
        PolicyId::Mixup => MixPolicy::Mixup(MixupParams { ratio: p.ratio()? }),
        PolicyId::CutMix => MixPolicy::CutMix(CutMixParams {
            ratio: p.ratio()?,
            placement: p.placement()?,
        }),
        PolicyId::TransMix => MixPolicy::TransMix(CutMixParams {
            ratio: p.ratio()?,
            placement: p.placement()?,
        }),
        PolicyId::FMix => {
            let reformulate = p.bool("reformulate", false)?;
            let ratio = if reformulate {
                p.ratio_with(|alpha| (alpha + 1.0, alpha))?
            } else {
                p.ratio()?
            };
            let max_soft = p.f32("max_soft", 0.0)?;
            if !(0.0..=0.5).contains(&max_soft) {
                return Err(p.invalid("max_soft", format!("{max_soft} outside [0, 0.5]")));
            }
            let threshold_iters = p.usize("threshold_iters", 32)?;
            if threshold_iters == 0 {
                return Err(p.invalid("threshold_iters", "must be > 0"));
            }
            MixPolicy::FMix(FMixParams {
                ratio,
                decay_power: p.positive("decay_power", 3.0)?,
                max_soft,
                reformulate,
                threshold_iters,
            })
        }
        PolicyId::ResizeMix => {
            let scope = p.range("scope")?.unwrap_or((0.1, 0.8));
            if scope.0 <= 0.0 || scope.1 > 1.0 {
                return Err(p.invalid("scope", "bounds must lie in (0, 1]"));
            }
            MixPolicy::ResizeMix(ResizeMixParams {
                ratio: p.ratio()?,
                scope: (scope.0 as f32, scope.1 as f32),
                use_alpha: p.bool("use_alpha", false)?,
            })
        }
        PolicyId::SaliencyMix => MixPolicy::SaliencyMix(SaliencyMixParams { ratio: p.ratio()? }),
        PolicyId::PuzzleMix => {
            let grid = p.usize("grid", 4)?;
            if grid == 0 {
                return Err(p.invalid("grid", "must be > 0"));
            }
            let beta = p.f32("beta", 1.2)?;
            if beta < 0.0 {
                return Err(p.invalid("beta", format!("{beta} must be >= 0")));
            }
            MixPolicy::PuzzleMix(PuzzleMixParams {
                ratio: p.ratio()?,
                grid,
                beta,
                max_flow_augmentations: p.usize("max_flow_augmentations", 10_000)?,
                max_bisection_iters: p.usize("max_bisection_iters", 16)?,
            })
        }
        PolicyId::AutoMix => MixPolicy::AutoMix(LearnedMixParams { ratio: p.ratio()? }),
        PolicyId::SAMix => MixPolicy::SAMix(LearnedMixParams { ratio: p.ratio()? }),
        PolicyId::ManifoldMix => MixPolicy::ManifoldMix(ManifoldMixParams {
            ratio: p.ratio()?,
            layers: p.layers()?,
        }),
        PolicyId::AlignMix => {
            let defaults = Alignment::default();
            let sinkhorn_iters = p.usize("sinkhorn_iters", defaults.sinkhorn_iters)?;
            if sinkhorn_iters == 0 {
                return Err(p.invalid("sinkhorn_iters", "must be > 0"));
            }
            MixPolicy::AlignMix(AlignMixParams {
                ratio: p.ratio()?,
                layers: p.layers()?,
                alignment: Alignment {
                    sinkhorn_iters,
                    epsilon: p.positive("epsilon", defaults.epsilon)?,
                },
            })
        }
    };
    Ok(policy)
}

/// Policy pool in configuration order (sorted by name)
pub fn build_pool(spec: &MixSpec) -> Result<Vec<PoolEntry>> {
    let registry = registry_for(spec)?;
    spec.policies
        .iter()
        .map(|(name, policy)| -> Result<PoolEntry> {
            let id = registry.resolve(name)?;
            Ok(PoolEntry {
                name: name.clone(),
                policy: policy_from_spec(id, name, policy)?,
            })
        })
        .collect()
}

/// Selection schedule matching the pool order of [`build_pool`]
pub fn build_schedule(spec: &MixSpec) -> Box<dyn SwitchSchedule> {
    let start: Vec<f32> = spec.policies.values().map(|p| p.probability).collect();
    match spec.switch {
        SwitchMode::Fixed => Box::new(FixedSwitch),
        SwitchMode::Random => Box::new(RandomSwitch::new(start)),
        SwitchMode::Scheduled => {
            let end = spec
                .policies
                .values()
                .map(|p| p.end_probability.unwrap_or(p.probability))
                .collect();
            Box::new(LinearSwitch::new(start, end, spec.ramp_steps.unwrap_or(1)))
        }
    }
}

/// Mix block with its own freshly built optimizer
pub fn build_mix_block(spec: &MixBlockSpec, run_seed: u64) -> Result<MixBlock> {
    let config = MixBlockConfig {
        in_channels: spec.in_channels,
        grid: spec.grid,
        hidden: spec.hidden,
        classifier_weight: spec.classifier_weight,
        adversarial_weight: spec.adversarial_weight,
        ratio_weight: spec.ratio_weight,
        entropy_weight: spec.entropy_weight,
        update: spec.update,
        max_grad_norm: spec.max_grad_norm,
        seed: spec.seed.unwrap_or(run_seed),
    };
    MixBlock::new(config, build_optimizer(&spec.optimizer)?)
}

/// Validate `spec` and assemble the dispatcher it describes
pub fn build_dispatcher(spec: &MixSpec) -> Result<MixDispatcher> {
    validate_config(spec)?;
    let pool = build_pool(spec)?;
    let learned = pool.iter().any(|e| e.policy.id().is_learned());

    let mut dispatcher = MixDispatcher::new(pool, build_schedule(spec), spec.seed)?
        .with_pairing(spec.pairing, spec.odd_sample)
        .with_label_options(LabelOptions {
            mode: spec.label_mode,
            rescale: spec.label_rescale,
            two_hot_scale: spec.two_hot_scale,
        })
        .with_strict_budget(spec.strict_budget);

    if let Some(block) = &spec.mix_block {
        if !learned {
            warn!("mix_block is configured but no learned policy is in the pool");
        }
        dispatcher = dispatcher.with_mix_block(build_mix_block(block, spec.seed)?);
    }
    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load::from_yaml_str;
    use crate::policy::{OddSample, PairingMode};

    #[test]
    fn test_build_optimizer_adam() {
        let mut params = HashMap::new();
        params.insert("beta1".to_string(), serde_json::json!(0.9));
        params.insert("beta2".to_string(), serde_json::json!(0.999));

        let spec = OptimSpec {
            name: "adam".to_string(),
            lr: 0.001,
            params,
        };

        let optimizer = build_optimizer(&spec).unwrap();
        assert_eq!(optimizer.lr(), 0.001);
        assert_eq!(optimizer.name(), "adam");
    }

    #[test]
    fn test_build_optimizer_sgd() {
        let mut params = HashMap::new();
        params.insert("momentum".to_string(), serde_json::json!(0.9));

        let spec = OptimSpec {
            name: "SGD".to_string(),
            lr: 0.01,
            params,
        };

        let optimizer = build_optimizer(&spec).unwrap();
        assert_eq!(optimizer.lr(), 0.01);
    }

    #[test]
    fn test_build_optimizer_unknown() {
        let spec = OptimSpec {
            name: "lion".to_string(),
            lr: 0.001,
            params: HashMap::new(),
        };
        assert!(matches!(
            build_optimizer(&spec),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_policy_params_parsed() {
        let spec = from_yaml_str(
            r#"
policies:
  fmix:
    probability: 0.5
    alpha: 2
    decay_power: 2.5
    max_soft: 0.1
    reformulate: true
  puzzlemix:
    probability: 0.5
    grid: 8
    beta: 0.5
    ratio_bounds: [0.3, 0.7]
"#,
        )
        .unwrap();
        let pool = build_pool(&spec).unwrap();
        assert_eq!(pool.len(), 2);

        match &pool[0].policy {
            MixPolicy::FMix(p) => {
                assert_eq!(p.decay_power, 2.5);
                assert_eq!(p.max_soft, 0.1);
                assert!(p.reformulate);
                assert_eq!(p.threshold_iters, 32);
            }
            other => panic!("expected fmix, got {:?}", other.id()),
        }
        match &pool[1].policy {
            MixPolicy::PuzzleMix(p) => {
                assert_eq!(p.grid, 8);
                assert_eq!(p.ratio.bounds(), Some((0.3, 0.7)));
            }
            other => panic!("expected puzzlemix, got {:?}", other.id()),
        }
    }

    #[test]
    fn test_alignmix_params() {
        let yaml = r#"
policies:
  alignmix:
    layers: [1, 2]
    sinkhorn_iters: 40
    epsilon: 0.05
"#;
        let spec = from_yaml_str(yaml).unwrap();
        let pool = build_pool(&spec).unwrap();
        match &pool[0].policy {
            MixPolicy::AlignMix(p) => {
                assert_eq!(p.layers, (1, 2));
                assert_eq!(p.alignment.sinkhorn_iters, 40);
                assert_eq!(p.alignment.epsilon, 0.05);
            }
            other => panic!("expected alignmix, got {:?}", other.id()),
        }

        let spec = from_yaml_str("policies:\n  alignmix: {}\n").unwrap();
        match &build_pool(&spec).unwrap()[0].policy {
            MixPolicy::AlignMix(p) => assert_eq!(p.alignment, Alignment::default()),
            other => panic!("expected alignmix, got {:?}", other.id()),
        }
    }

    #[test]
    fn test_bad_values_rejected() {
        for yaml in [
            "policies:\n  cutmix:\n    placement: diagonal\n",
            "policies:\n  mixup:\n    ratio_bounds: [0.8, 0.2]\n",
            "policies:\n  mixup:\n    ratio_bounds: [0.2, 1.5]\n",
            "policies:\n  fmix:\n    max_soft: 0.9\n",
            "policies:\n  puzzlemix:\n    grid: 0\n",
            "policies:\n  resizemix:\n    scope: [0.0, 0.5]\n",
            "policies:\n  manifoldmix:\n    layers: [0.5, 2]\n",
            "policies:\n  alignmix:\n    sinkhorn_iters: 0\n",
            "policies:\n  alignmix:\n    epsilon: -0.1\n",
            "policies:\n  mixup:\n    alpha: fast\n",
        ] {
            let err = from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, Error::ConfigError(_)), "{yaml}: {err}");
        }
    }

    #[test]
    fn test_build_dispatcher() {
        let spec = from_yaml_str(
            r#"
seed: 3
pairing: adjacent
odd_sample: self
policies:
  mixup:
    probability: 0.25
  cutmix:
    probability: 0.75
"#,
        )
        .unwrap();
        let dispatcher = build_dispatcher(&spec).unwrap();
        assert_eq!(dispatcher.seed(), 3);
        let names: Vec<_> = dispatcher.pool().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["cutmix", "mixup"]);
        assert_eq!(dispatcher.weights(), vec![0.75, 0.25]);
        assert!(dispatcher.mix_block().is_none());

        let spec = from_yaml_str(
            "pairing: adjacent\nodd_sample: skip\npolicies:\n  identity: {}\n",
        )
        .unwrap();
        assert_eq!(spec.pairing, PairingMode::Adjacent);
        assert_eq!(spec.odd_sample, OddSample::Skip);
        assert!(build_dispatcher(&spec).is_ok());
    }

    #[test]
    fn test_build_learned_dispatcher() {
        let spec = from_yaml_str(
            r#"
seed: 11
switch: fixed
policies:
  samix:
    alpha: 2.0
mix_block:
  in_channels: 1
  grid: 4
  adversarial_weight: 0.5
  optimizer:
    name: sgd
    lr: 0.1
"#,
        )
        .unwrap();
        let dispatcher = build_dispatcher(&spec).unwrap();
        let block = dispatcher.mix_block().unwrap();
        assert_eq!(block.config().in_channels, 1);
        assert_eq!(block.config().seed, 11);
        assert_eq!(block.config().adversarial_weight, 0.5);
        assert_eq!(block.optimizer().lr(), 0.1);
    }
}
