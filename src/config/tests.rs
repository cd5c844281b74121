//! Integration tests for config module

use super::*;
use crate::batch::{ImageBatch, Labels};
use crate::error::Error;
use crate::policy::PolicyId;
use ndarray::Array4;
use std::io::Write;
use tempfile::NamedTempFile;

fn batch(n: usize, c: usize) -> ImageBatch {
    let images = Array4::from_shape_fn((n, c, 16, 16), |(i, ch, y, x)| {
        ((i * 13 + ch * 5 + y * 16 + x) % 23) as f32 / 23.0
    });
    ImageBatch::new(images, Labels::indices((0..n).map(|i| i % 3).collect(), 3).unwrap()).unwrap()
}

#[test]
fn test_end_to_end_config_loading() {
    let yaml = r#"
seed: 42
switch: scheduled
ramp_steps: 10
aliases:
  sal: saliencymix
policies:
  mixup:
    probability: 1.0
    end_probability: 0.0
    alpha: 0.4
  sal:
    probability: 0.0
    end_probability: 1.0
"#;

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(yaml.as_bytes()).unwrap();

    let spec = load_config(temp_file.path()).unwrap();
    let mut dispatcher = build_dispatcher(&spec).unwrap();
    let b = batch(4, 3);

    // weights ramp from mixup only to saliencymix only
    assert_eq!(dispatcher.select_policy(0), PolicyId::Mixup);
    for _ in 0..10 {
        dispatcher.next(&b).unwrap();
    }
    assert_eq!(dispatcher.select_policy(10), PolicyId::SaliencyMix);
    let out = dispatcher.next(&b).unwrap();
    assert_eq!(out.metadata.policy, PolicyId::SaliencyMix);
}

#[test]
fn test_minimal_config_defaults() {
    let spec = from_yaml_str("policies:\n  cutmix: {}\n").unwrap();
    assert_eq!(spec.switch, SwitchMode::Random);
    assert!(!spec.strict_budget);
    assert!(spec.mix_block.is_none());

    let mut dispatcher = build_dispatcher(&spec).unwrap();
    let out = dispatcher.next(&batch(2, 3)).unwrap();
    assert_eq!(out.metadata.policy, PolicyId::CutMix);
}

#[test]
fn test_unregistered_policy_fails_before_any_step() {
    let err = from_yaml_str("policies:\n  snapmix:\n    alpha: 1.0\n").unwrap_err();
    match err {
        Error::ConfigError(msg) => assert!(msg.contains("snapmix"), "{msg}"),
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn test_build_rejects_unvalidated_spec() {
    let mut spec = from_yaml_str("policies:\n  mixup: {}\n").unwrap();
    spec.policies.get_mut("mixup").unwrap().probability = 0.4;
    assert!(matches!(build_dispatcher(&spec), Err(Error::ConfigError(_))));
}

#[test]
fn test_learned_config_runs() {
    let yaml = r#"
switch: fixed
policies:
  automix:
    alpha: 2.0
mix_block:
  in_channels: 1
  grid: 4
  hidden: 6
  update:
    mode: alternating
    period: 3
  optimizer:
    name: adam
    lr: 0.01
"#;
    let spec = from_yaml_str(yaml).unwrap();
    let mut dispatcher = build_dispatcher(&spec).unwrap();
    let out = dispatcher.next(&batch(3, 1)).unwrap();
    assert_eq!(out.metadata.policy, PolicyId::AutoMix);
    assert_eq!(out.metadata.block_logits.as_ref().map(Vec::len), Some(3));
    assert_eq!(dispatcher.mix_block().unwrap().pending(), 3);
}
