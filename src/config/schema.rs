//! YAML schema definitions for declarative mix configuration

use crate::mixblock::UpdateDiscipline;
use crate::mixer::{LabelMode, RatioRescale};
use crate::policy::{OddSample, PairingMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Complete mixing specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixSpec {
    /// Run seed; every step derives its generators from it
    #[serde(default)]
    pub seed: u64,

    /// How a policy is chosen per batch
    #[serde(default)]
    pub switch: SwitchMode,

    /// Steps over which `scheduled` moves from `probability` to
    /// `end_probability`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_steps: Option<u64>,

    #[serde(default)]
    pub pairing: PairingMode,

    #[serde(default)]
    pub odd_sample: OddSample,

    #[serde(default)]
    pub label_mode: LabelMode,

    /// Reshaping of label ratios before the labels are mixed
    #[serde(default, skip_serializing_if = "RatioRescale::is_identity")]
    pub label_rescale: RatioRescale,

    /// Weight of the minor class relative to the dominant one under
    /// `label_mode: two_hot`
    #[serde(default = "default_one")]
    pub two_hot_scale: f32,

    /// Fail the step when an optimization budget runs out
    #[serde(default)]
    pub strict_budget: bool,

    /// Extra names for registered policies (alias -> policy name)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,

    /// Policy pool, keyed by policy name
    pub policies: BTreeMap<String, PolicySpec>,

    /// Learned mask generator, required by automix and samix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mix_block: Option<MixBlockSpec>,
}

/// Policy selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    /// The single configured policy, every batch
    Fixed,
    /// Weighted draw per batch
    #[default]
    Random,
    /// Weighted draw with linearly ramped weights
    Scheduled,
}

/// One pool entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Selection weight; weights of the pool sum to one
    #[serde(default = "default_probability")]
    pub probability: f32,

    /// Weight at the end of the ramp (`scheduled` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_probability: Option<f32>,

    /// Policy hyperparameters (alpha, ratio_bounds, placement, grid, ...)
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Learned mix block specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixBlockSpec {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    #[serde(default = "default_grid")]
    pub grid: usize,

    #[serde(default = "default_hidden")]
    pub hidden: usize,

    #[serde(default = "default_one")]
    pub classifier_weight: f32,

    #[serde(default)]
    pub adversarial_weight: f32,

    #[serde(default = "default_one")]
    pub ratio_weight: f32,

    #[serde(default)]
    pub entropy_weight: f32,

    #[serde(default)]
    pub update: UpdateDiscipline,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grad_norm: Option<f32>,

    /// Initialization seed; the run seed when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// The block's own optimizer
    pub optimizer: OptimSpec,
}

/// Optimizer specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSpec {
    /// Optimizer name: "adam" | "sgd"
    pub name: String,

    /// Learning rate
    pub lr: f32,

    /// Optimizer-specific parameters (beta1, beta2, momentum, etc.)
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

fn default_probability() -> f32 {
    1.0
}

fn default_in_channels() -> usize {
    3
}

fn default_grid() -> usize {
    8
}

fn default_hidden() -> usize {
    16
}

fn default_one() -> f32 {
    1.0
}
