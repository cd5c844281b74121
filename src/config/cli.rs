//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! mezclar validate mix.yaml
//! mezclar info mix.yaml --format json
//! mezclar preview mix.yaml --steps 4 --batch-size 8
//! mezclar preview mix.yaml --policy puzzlemix --size 64
//! ```

use super::schema::MixSpec;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// Mezclar: mixup augmentation engine
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "mezclar")]
#[command(version)]
#[command(about = "Validate and exercise mixup augmentation policies")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a configuration file
    Validate(ValidateArgs),

    /// Display information about a configuration
    Info(InfoArgs),

    /// Mix synthetic batches with a configuration and report the results
    Preview(PreviewArgs),
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Also build the dispatcher and mix block
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the preview command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct PreviewArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Number of batches to dispatch
    #[arg(long, default_value = "1")]
    pub steps: u64,

    /// Samples per synthetic batch
    #[arg(short, long, default_value = "8")]
    pub batch_size: usize,

    /// Side of the synthetic square images
    #[arg(long, default_value = "32")]
    pub size: usize,

    /// Channels of the synthetic images; defaults to the mix block's input
    #[arg(long)]
    pub channels: Option<usize>,

    /// Classes of the synthetic labels
    #[arg(long, default_value = "10")]
    pub classes: usize,

    /// Force one policy from the pool instead of the configured switch
    #[arg(long)]
    pub policy: Option<String>,

    /// Override the run seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!(
                "Unknown output format: {s}. Valid formats: text, json, yaml"
            )),
        }
    }
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to a MixSpec
pub fn apply_overrides(spec: &mut MixSpec, args: &PreviewArgs) {
    if let Some(seed) = args.seed {
        spec.seed = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validate_command() {
        let cli = parse_args(["mezclar", "validate", "mix.yaml"]).unwrap();
        match cli.command {
            Command::Validate(args) => {
                assert_eq!(args.config, PathBuf::from("mix.yaml"));
                assert!(!args.detailed);
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_parse_info_json_format() {
        let cli = parse_args(["mezclar", "info", "mix.yaml", "--format", "json"]).unwrap();
        match cli.command {
            Command::Info(args) => assert_eq!(args.format, OutputFormat::Json),
            _ => panic!("Expected Info command"),
        }
    }

    #[test]
    fn test_parse_preview_defaults() {
        let cli = parse_args(["mezclar", "preview", "mix.yaml"]).unwrap();
        match cli.command {
            Command::Preview(args) => {
                assert_eq!(args.steps, 1);
                assert_eq!(args.batch_size, 8);
                assert_eq!(args.size, 32);
                assert_eq!(args.channels, None);
                assert_eq!(args.policy, None);
                assert_eq!(args.format, OutputFormat::Text);
            }
            _ => panic!("Expected Preview command"),
        }
    }

    #[test]
    fn test_parse_preview_with_options() {
        let cli = parse_args([
            "mezclar",
            "preview",
            "mix.yaml",
            "--steps",
            "5",
            "-b",
            "3",
            "--policy",
            "cutmix",
            "--seed",
            "9",
            "-f",
            "yaml",
        ])
        .unwrap();
        match cli.command {
            Command::Preview(args) => {
                assert_eq!(args.steps, 5);
                assert_eq!(args.batch_size, 3);
                assert_eq!(args.policy.as_deref(), Some("cutmix"));
                assert_eq!(args.seed, Some(9));
                assert_eq!(args.format, OutputFormat::Yaml);
            }
            _ => panic!("Expected Preview command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = parse_args(["mezclar", "-v", "validate", "mix.yaml"]).unwrap();
        assert!(cli.verbose);
        assert!(!cli.quiet);

        let cli = parse_args(["mezclar", "validate", "mix.yaml", "-q"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(parse_args(["mezclar", "validate"]).is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse_args(["mezclar", "train", "mix.yaml"]).is_err());
    }

    #[test]
    fn test_seed_override() {
        let mut spec: MixSpec = serde_yaml::from_str("policies:\n  mixup: {}\n").unwrap();
        let cli = parse_args(["mezclar", "preview", "mix.yaml", "--seed", "77"]).unwrap();
        let Command::Preview(args) = cli.command else {
            panic!("Expected Preview command");
        };
        apply_overrides(&mut spec, &args);
        assert_eq!(spec.seed, 77);
    }
}
