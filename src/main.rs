//! Mezclar CLI
//!
//! Validates mix configurations and previews what they do to synthetic
//! batches, without a host training loop.
//!
//! # Usage
//!
//! ```bash
//! # Validate config
//! mezclar validate mix.yaml
//!
//! # Show config info
//! mezclar info mix.yaml --format yaml
//!
//! # Dispatch a few synthetic batches
//! mezclar preview mix.yaml --steps 4 -v
//! ```

use clap::Parser;
use mezclar::config::{
    apply_overrides, build_dispatcher, load_config, registry_for, Cli, Command, InfoArgs,
    OutputFormat, PreviewArgs, ValidateArgs,
};
use mezclar::metadata::MixSummary;
use mezclar::{ImageBatch, Labels};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Validate(args) => run_validate(args),
        Command::Info(args) => run_info(args),
        Command::Preview(args) => run_preview(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_validate(args: ValidateArgs) -> Result<(), String> {
    info!(config = %args.config.display(), "validating config");

    let spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;

    if args.detailed {
        let dispatcher = build_dispatcher(&spec).map_err(|e| format!("Build error: {e}"))?;
        println!("Configuration Summary:");
        println!("  Seed: {}", spec.seed);
        println!("  Switch: {:?}", spec.switch);
        println!("  Pairing: {:?} (odd: {:?})", spec.pairing, spec.odd_sample);
        println!("  Labels: {:?}", spec.label_mode);
        println!();
        for (entry, weight) in dispatcher.pool().iter().zip(dispatcher.weights()) {
            println!("  {:<12} -> {:<12} p={weight:.3}", entry.name, entry.policy.id());
        }
        if let Some(block) = dispatcher.mix_block() {
            println!();
            println!("  Mix block:");
            println!("    Grid: {}", block.config().grid);
            println!("    Hidden: {}", block.config().hidden);
            println!("    Update: {:?}", block.config().update);
            println!(
                "    Optimizer: {} (lr={})",
                block.optimizer().name(),
                block.optimizer().lr()
            );
        }
    }

    info!("configuration is valid");
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), String> {
    let spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;

    match args.format {
        OutputFormat::Text => {
            let registry = registry_for(&spec).map_err(|e| e.to_string())?;
            println!("Seed: {}", spec.seed);
            println!("Switch: {:?}", spec.switch);
            for (name, policy) in &spec.policies {
                let id = registry.resolve(name).map_err(|e| e.to_string())?;
                let end = policy
                    .end_probability
                    .map(|p| format!(" -> {p}"))
                    .unwrap_or_default();
                println!(
                    "Policy {name} ({id}, {:?} mask): p={}{end}",
                    id.mask_kind(),
                    policy.probability
                );
            }
            if spec.mix_block.is_some() {
                println!("Mix block: enabled");
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&spec)
                .map_err(|e| format!("JSON serialization error: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&spec)
                .map_err(|e| format!("YAML serialization error: {e}"))?;
            println!("{yaml}");
        }
    }

    Ok(())
}

/// Smooth random images so saliency and Fourier masks have structure to follow
fn synthetic_batch(args: &PreviewArgs, channels: usize, seed: u64) -> Result<ImageBatch, String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = args.batch_size;
    let phases: Vec<(f32, f32)> = (0..n * channels)
        .map(|_| {
            let phase = rng.random_range(0.0..std::f32::consts::TAU);
            (phase, rng.random_range(0.5..3.0))
        })
        .collect();
    let size = args.size as f32;
    let images = Array4::from_shape_fn((n, channels, args.size, args.size), |(i, c, y, x)| {
        let (phase, freq) = phases[i * channels + c];
        let u = freq * (x as f32 + 0.5 * y as f32) / size;
        0.5 + 0.5 * (u * std::f32::consts::TAU + phase).sin()
    });
    let classes = args.classes.max(1);
    let labels = Labels::indices((0..n).map(|i| i % classes).collect(), classes)
        .map_err(|e| e.to_string())?;
    ImageBatch::new(images, labels).map_err(|e| e.to_string())
}

fn run_preview(args: PreviewArgs) -> Result<(), String> {
    let mut spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    apply_overrides(&mut spec, &args);

    let mut dispatcher = build_dispatcher(&spec).map_err(|e| format!("Build error: {e}"))?;
    let forced = match &args.policy {
        Some(name) => {
            let registry = registry_for(&spec).map_err(|e| e.to_string())?;
            Some(registry.resolve(name).map_err(|e| e.to_string())?)
        }
        None => None,
    };
    let channels = args
        .channels
        .or_else(|| dispatcher.mix_block().map(|b| b.config().in_channels))
        .unwrap_or(3);
    let batch = synthetic_batch(&args, channels, spec.seed)?;
    debug!(
        batch = batch.len(),
        channels,
        size = args.size,
        "synthetic batch ready"
    );

    let mut summaries: Vec<MixSummary> = Vec::new();
    for _ in 0..args.steps {
        let output = match forced {
            Some(policy) => dispatcher.dispatch(policy, &batch),
            None => dispatcher.next(&batch),
        }
        .map_err(|e| format!("Dispatch error: {e}"))?;
        if let Some(block) = dispatcher.mix_block_mut() {
            // no classifier here, so nothing to train the proposals on
            block.discard_pending();
        }
        summaries.push(output.metadata.summary());
    }

    match args.format {
        OutputFormat::Text => {
            for s in &summaries {
                println!(
                    "step {:>4}  {:<12} requested={:.3} mean={:.3}{}",
                    s.step,
                    s.policy,
                    s.requested_ratio,
                    s.mean_ratio,
                    if s.budget_exhausted { "  (budget exhausted)" } else { "" }
                );
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&summaries)
                .map_err(|e| format!("JSON serialization error: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&summaries)
                .map_err(|e| format!("YAML serialization error: {e}"))?;
            println!("{yaml}");
        }
    }

    Ok(())
}
