#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mezclar::config::{build_dispatcher, from_yaml_str};
use mezclar::{ImageBatch, Labels};
use ndarray::Array4;

const POLICIES: [&str; 8] = [
    "mixup",
    "cutmix",
    "fmix",
    "resizemix",
    "saliencymix",
    "puzzlemix",
    "transmix",
    "identity",
];

/// Fuzz target for dispatching arbitrary batches
///
/// Masks must stay in [0, 1] and soft labels must stay distributions for
/// any image content, batch shape and seed.
#[derive(Arbitrary, Debug)]
struct MixFuzzInput {
    policy: u8,
    seed: u64,
    batch: u8,  // 1..=8 samples
    height: u8, // 1..=24 pixels
    width: u8,
    pixels: Vec<u8>,
}

fuzz_target!(|input: MixFuzzInput| {
    let name = POLICIES[input.policy as usize % POLICIES.len()];
    let n = input.batch as usize % 8 + 1;
    let h = input.height as usize % 24 + 1;
    let w = input.width as usize % 24 + 1;
    if input.pixels.is_empty() {
        return;
    }

    let images = Array4::from_shape_fn((n, 1, h, w), |(i, _, y, x)| {
        let idx = (i * h * w + y * w + x) % input.pixels.len();
        input.pixels[idx] as f32 / 255.0
    });
    let labels = Labels::indices((0..n).map(|i| i % 3).collect(), 3).unwrap();
    let batch = ImageBatch::new(images, labels).unwrap();

    let yaml = format!("seed: {}\npolicies:\n  {name}: {{}}\n", input.seed);
    let mut dispatcher = build_dispatcher(&from_yaml_str(&yaml).unwrap()).unwrap();
    let out = dispatcher.next(&batch).unwrap();

    // Invariant 1: masks are weights
    for mask in &out.metadata.masks {
        assert!(mask.check_range().is_ok());
    }

    // Invariant 2: soft targets are distributions
    for row in out.labels.to_soft().rows() {
        assert!((row.sum() - 1.0).abs() < 1e-3);
    }
});
