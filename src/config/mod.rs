//! Declarative YAML configuration
//!
//! # Example
//!
//! ```yaml
//! seed: 42
//! switch: scheduled
//! ramp_steps: 5000
//!
//! policies:
//!   mixup:
//!     probability: 0.7
//!     end_probability: 0.2
//!     alpha: 1.0
//!   puzzlemix:
//!     probability: 0.3
//!     end_probability: 0.8
//!     grid: 4
//!     beta: 1.2
//!
//! label_mode: soft
//! strict_budget: false
//! ```

mod builder;
mod cli;
mod load;
mod schema;
mod validate;

#[cfg(test)]
mod tests;

#[cfg(test)]
mod property_tests;

pub use builder::{build_dispatcher, build_mix_block, build_optimizer, build_pool, build_schedule};
pub use cli::{
    apply_overrides, parse_args, Cli, Command, InfoArgs, OutputFormat, PreviewArgs, ValidateArgs,
};
pub use load::{from_yaml_str, load_config};
pub use schema::{MixBlockSpec, MixSpec, OptimSpec, PolicySpec, SwitchMode};
pub use validate::{registry_for, validate_config, ValidationError, PROBABILITY_TOLERANCE};
