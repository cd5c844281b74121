//! Configuration validation

use super::builder::policy_from_spec;
use super::schema::{MixSpec, SwitchMode};
use crate::error::Error;
use crate::mixblock::UpdateDiscipline;
use crate::policy::{PolicyId, PolicyRegistry};
use std::collections::HashMap;

/// Allowed deviation of a probability column from one
pub const PROBABILITY_TOLERANCE: f32 = 1e-3;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Policy pool is empty")]
    EmptyPool,

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Policies '{first}' and '{second}' name the same policy")]
    DuplicatePolicy { first: String, second: String },

    #[error("Invalid alias '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },

    #[error("Unknown parameter '{key}' for policy {policy} (allowed: {allowed})")]
    UnknownParameter {
        policy: String,
        key: String,
        allowed: String,
    },

    #[error("Invalid value for {policy}.{key}: {reason}")]
    InvalidValue {
        policy: String,
        key: String,
        reason: String,
    },

    #[error("Invalid probability {value} for policy {policy} (must be in [0, 1])")]
    InvalidProbability { policy: String, value: f32 },

    #[error("Policy {field} values sum to {sum} (must sum to 1)")]
    ProbabilitySum { field: &'static str, sum: f32 },

    #[error("Switch mode 'fixed' needs exactly one policy, got {0}")]
    FixedNeedsSinglePolicy(usize),

    #[error("Switch mode 'scheduled' needs ramp_steps > 0")]
    MissingRampSteps,

    #[error("end_probability on policy {0} requires switch mode 'scheduled'")]
    EndProbabilityWithoutSchedule(String),

    #[error("Invalid label options: {0}")]
    InvalidLabels(String),

    #[error("Policy {0} requires a mix_block section")]
    MissingMixBlock(String),

    #[error("Invalid mix block: {0}")]
    InvalidMixBlock(String),

    #[error("Invalid optimizer: {0} (must be one of: adam, sgd)")]
    InvalidOptimizer(String),

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::ConfigError(format!("Invalid config: {e}"))
    }
}

/// Registry with the spec's aliases registered on top of the built-ins
pub fn registry_for(spec: &MixSpec) -> Result<PolicyRegistry, ValidationError> {
    let mut registry = PolicyRegistry::with_builtins();
    for (alias, target) in &spec.aliases {
        let id = registry
            .resolve(target)
            .map_err(|_| ValidationError::UnknownPolicy(target.clone()))?;
        registry
            .register_alias(alias, id)
            .map_err(|e| ValidationError::InvalidAlias {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(registry)
}

/// Validate a mixing specification
///
/// Checks:
/// - Policy names resolve and appear once
/// - Hyperparameter keys are known and their values in range
/// - Probabilities are in [0, 1] and sum to one
/// - The switch mode fits the pool
/// - Learned policies come with a usable mix block
/// - Label rescaling and the two-hot scale are usable
pub fn validate_config(spec: &MixSpec) -> Result<(), ValidationError> {
    if spec.policies.is_empty() {
        return Err(ValidationError::EmptyPool);
    }
    let registry = registry_for(spec)?;

    let mut seen: HashMap<PolicyId, &str> = HashMap::new();
    for (name, policy) in &spec.policies {
        let id = registry
            .resolve(name)
            .map_err(|_| ValidationError::UnknownPolicy(name.clone()))?;
        if let Some(first) = seen.insert(id, name) {
            return Err(ValidationError::DuplicatePolicy {
                first: first.to_string(),
                second: name.clone(),
            });
        }

        let allowed = id.param_keys();
        if let Some(key) = policy
            .params
            .keys()
            .find(|k| !allowed.contains(&k.as_str()))
        {
            return Err(ValidationError::UnknownParameter {
                policy: name.clone(),
                key: key.clone(),
                allowed: allowed.join(", "),
            });
        }

        for value in std::iter::once(policy.probability).chain(policy.end_probability) {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::InvalidProbability {
                    policy: name.clone(),
                    value,
                });
            }
        }
        if policy.end_probability.is_some() && spec.switch != SwitchMode::Scheduled {
            return Err(ValidationError::EndProbabilityWithoutSchedule(name.clone()));
        }

        policy_from_spec(id, name, policy)?;

        if id.is_learned() && spec.mix_block.is_none() {
            return Err(ValidationError::MissingMixBlock(name.clone()));
        }
    }

    check_sum(
        "probability",
        spec.policies.values().map(|p| p.probability),
    )?;

    match spec.switch {
        SwitchMode::Fixed if spec.policies.len() != 1 => {
            return Err(ValidationError::FixedNeedsSinglePolicy(spec.policies.len()));
        }
        SwitchMode::Scheduled => {
            if spec.ramp_steps.unwrap_or(0) == 0 {
                return Err(ValidationError::MissingRampSteps);
            }
            check_sum(
                "end_probability",
                spec.policies
                    .values()
                    .map(|p| p.end_probability.unwrap_or(p.probability)),
            )?;
        }
        _ => {}
    }

    let rescale = &spec.label_rescale;
    if !(rescale.threshold > 0.0 && rescale.threshold <= 1.0) {
        return Err(ValidationError::InvalidLabels(format!(
            "label_rescale.threshold {} outside (0, 1]",
            rescale.threshold
        )));
    }
    if !rescale.exponent.is_finite() || rescale.exponent <= 0.0 {
        return Err(ValidationError::InvalidLabels(format!(
            "label_rescale.exponent {} must be > 0",
            rescale.exponent
        )));
    }
    if !(rescale.bias > -1.0 && rescale.bias < 1.0) {
        return Err(ValidationError::InvalidLabels(format!(
            "label_rescale.bias {} outside (-1, 1)",
            rescale.bias
        )));
    }
    if !spec.two_hot_scale.is_finite() || spec.two_hot_scale <= 0.0 {
        return Err(ValidationError::InvalidLabels(format!(
            "two_hot_scale {} must be > 0",
            spec.two_hot_scale
        )));
    }

    if let Some(block) = &spec.mix_block {
        if block.in_channels == 0 || block.grid == 0 || block.hidden == 0 {
            return Err(ValidationError::InvalidMixBlock(
                "in_channels, grid and hidden must be > 0".to_string(),
            ));
        }
        let weights = [
            block.classifier_weight,
            block.adversarial_weight,
            block.ratio_weight,
            block.entropy_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ValidationError::InvalidMixBlock(
                "loss weights must be finite and >= 0".to_string(),
            ));
        }
        if let UpdateDiscipline::Alternating { period: 0 } = block.update {
            return Err(ValidationError::InvalidMixBlock(
                "alternating period must be > 0".to_string(),
            ));
        }
        if let Some(norm) = block.max_grad_norm {
            if norm <= 0.0 {
                return Err(ValidationError::InvalidMixBlock(format!(
                    "max_grad_norm {norm} must be > 0"
                )));
            }
        }
        let valid_optimizers = ["adam", "sgd"];
        if !valid_optimizers.contains(&block.optimizer.name.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidOptimizer(
                block.optimizer.name.clone(),
            ));
        }
        if block.optimizer.lr <= 0.0 {
            return Err(ValidationError::InvalidLearningRate(block.optimizer.lr));
        }
    }

    Ok(())
}

fn check_sum(
    field: &'static str,
    values: impl Iterator<Item = f32>,
) -> Result<(), ValidationError> {
    let sum: f32 = values.sum();
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(ValidationError::ProbabilitySum { field, sum });
    }
    Ok(())
}
