//! Learned mixing trained alongside a small softmax classifier.
//!
//! The classifier is a single linear layer, enough to produce an input
//! gradient for the mix block to learn from.

use mezclar::config::{build_dispatcher, from_yaml_str};
use mezclar::loss::{mixed_loss, LossFn};
use mezclar::mixblock::UpdateDiscipline;
use mezclar::optim::Adam;
use mezclar::session::{BackwardPass, ForwardPass, MixClassifier, MixSession};
use mezclar::{
    ImageBatch, Labels, MixBlock, MixBlockConfig, MixMetadata, MixedLabels, PolicyId, Result,
};
use ndarray::{Array1, Array2, Array4, ArrayView1};

const SIZE: usize = 8;
const CLASSES: usize = 3;

/// Softmax cross entropy against a soft target
struct CrossEntropy;

impl LossFn for CrossEntropy {
    fn sample_loss(
        &self,
        logits: ArrayView1<'_, f32>,
        target: ArrayView1<'_, f32>,
    ) -> (f32, Array1<f32>) {
        let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp = logits.mapv(|v| (v - max).exp());
        let probs = &exp / exp.sum();
        let ce: f32 = target
            .iter()
            .zip(probs.iter())
            .map(|(&t, &p)| -t * (p + 1e-10).ln())
            .sum();
        (ce, &probs * target.sum() - &target)
    }

    fn name(&self) -> &str {
        "CrossEntropy"
    }
}

/// Linear softmax classifier over flattened single-channel images
struct LinearClassifier {
    weights: Array2<f32>,
    lr: f32,
    with_input_grad: bool,
    inputs: Option<Array2<f32>>,
    pending: Option<Array2<f32>>,
    losses: Vec<f32>,
}

impl LinearClassifier {
    fn new(with_input_grad: bool) -> Self {
        let d = SIZE * SIZE;
        Self {
            weights: Array2::from_shape_fn((CLASSES, d), |(k, j)| {
                ((k * 7 + j * 3) % 11) as f32 / 110.0 - 0.05
            }),
            lr: 0.1,
            with_input_grad,
            inputs: None,
            pending: None,
            losses: Vec::new(),
        }
    }
}

impl MixClassifier for LinearClassifier {
    fn forward(&mut self, images: &Array4<f32>, _: &MixMetadata) -> Result<ForwardPass> {
        let (n, c, h, w) = images.dim();
        let x = Array2::from_shape_vec((n, c * h * w), images.iter().copied().collect())
            .map_err(|e| mezclar::Error::InvalidParameter(e.to_string()))?;
        let logits = x.dot(&self.weights.t());
        self.inputs = Some(x);
        Ok(ForwardPass {
            logits,
            attention: None,
        })
    }

    fn backward(&mut self, pass: &ForwardPass, labels: &MixedLabels) -> Result<BackwardPass> {
        let out = mixed_loss(&CrossEntropy, &pass.logits, labels)?;
        let x = self.inputs.as_ref().expect("forward before backward");
        self.pending = Some(out.grad.t().dot(x));
        self.losses.push(out.loss);

        let input_grad = if self.with_input_grad {
            let n = pass.logits.nrows();
            let flat = out.grad.dot(&self.weights);
            Some(
                Array4::from_shape_vec((n, 1, SIZE, SIZE), flat.iter().copied().collect())
                    .map_err(|e| mezclar::Error::InvalidParameter(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(BackwardPass {
            loss: out.loss,
            input_grad,
        })
    }

    fn apply_gradients(&mut self) -> Result<()> {
        if let Some(grad) = self.pending.take() {
            self.weights.scaled_add(-self.lr, &grad);
        }
        Ok(())
    }
}

fn batch() -> ImageBatch {
    let images = Array4::from_shape_fn((4, 1, SIZE, SIZE), |(i, _, y, x)| match i % 3 {
        0 => y as f32 / SIZE as f32,
        1 => x as f32 / SIZE as f32,
        _ => ((x + y) % 2) as f32,
    });
    ImageBatch::new(images, Labels::indices(vec![0, 1, 2, 0], CLASSES).unwrap()).unwrap()
}

fn session(policies: &str, block: &str) -> MixSession {
    let yaml = format!(
        r#"
seed: 21
policies:
{policies}
mix_block:
  in_channels: 1
  grid: 4
  hidden: 8
{block}
  optimizer:
    name: adam
    lr: 0.01
"#
    );
    MixSession::new(build_dispatcher(&from_yaml_str(&yaml).unwrap()).unwrap())
}

fn snapshot(session: &MixSession) -> Vec<Array1<f32>> {
    let block = session.dispatcher().mix_block().unwrap();
    block.parameters().iter().map(|p| p.data().clone()).collect()
}

// ============================================================
// Update disciplines
// ============================================================

#[test]
fn test_automix_block_trains_every_step() {
    let mut session = session("  automix:\n    alpha: 2.0", "");
    let mut model = LinearClassifier::new(true);
    let before = snapshot(&session);
    let b = batch();

    for step in 0..4 {
        let report = session.step(&b, &mut model).unwrap();
        assert_eq!(report.policy, PolicyId::AutoMix);
        assert_eq!(report.step, step);
        let block = report.block.expect("simultaneous update");
        assert!(block.updated);
        assert_eq!(block.proposals, 4);
        assert!(block.grad_norm.is_finite());
        assert!(report.loss.is_finite());
        assert_eq!(session.dispatcher().mix_block().unwrap().pending(), 0);
    }

    assert_eq!(session.dispatcher().mix_block().unwrap().updates(), 4);
    let after = snapshot(&session);
    assert!(before.iter().zip(&after).any(|(a, b)| a != b));
    assert_eq!(model.losses.len(), 4);
}

#[test]
fn test_samix_alternating_updates() {
    let block = "  adversarial_weight: 0.5\n  update:\n    mode: alternating\n    period: 2";
    let mut session = session("  samix: {}", block);
    let mut model = LinearClassifier::new(true);
    let b = batch();

    for step in 0..5u64 {
        let report = session.step(&b, &mut model).unwrap();
        assert_eq!(report.policy, PolicyId::SAMix);
        assert_eq!(report.block.is_some(), step % 2 == 0, "step {step}");
        // off-period proposals are dropped, never carried over
        assert_eq!(session.dispatcher().mix_block().unwrap().pending(), 0);
    }
    assert_eq!(session.dispatcher().mix_block().unwrap().updates(), 3);
}

#[test]
fn test_block_trains_without_input_gradient() {
    let mut session = session("  automix: {}", "  ratio_weight: 2.0");
    let mut model = LinearClassifier::new(false);
    let report = session.step(&batch(), &mut model).unwrap();
    let block = report.block.unwrap();
    assert!(block.updated);
    assert!(block.ratio_gap >= 0.0);
    assert_eq!(session.dispatcher().mix_block().unwrap().updates(), 1);
}

#[test]
fn test_mixed_pool_only_learned_steps_touch_block() {
    let policies = "  automix:\n    probability: 0.5\n  mixup:\n    probability: 0.5";
    let mut session = session(policies, "");
    let mut model = LinearClassifier::new(true);
    let b = batch();

    let mut learned = 0;
    for _ in 0..12 {
        let report = session.step(&b, &mut model).unwrap();
        if report.policy == PolicyId::AutoMix {
            learned += 1;
            assert!(report.block.is_some());
        } else {
            assert!(report.block.is_none());
        }
    }
    assert_eq!(session.dispatcher().mix_block().unwrap().updates(), learned);
}

// ============================================================
// Parameter persistence
// ============================================================

#[test]
fn test_restored_parameters_reproduce_masks() {
    let config = |seed| MixBlockConfig {
        in_channels: 1,
        grid: 4,
        hidden: 8,
        update: UpdateDiscipline::Simultaneous,
        seed,
        ..MixBlockConfig::default()
    };
    let mut trained = MixBlock::new(config(1), Box::new(Adam::default_params(0.01))).unwrap();
    let mut restored = MixBlock::new(config(2), Box::new(Adam::default_params(0.01))).unwrap();

    let saved: Vec<Array1<f32>> = trained.parameters().iter().map(|p| p.data().clone()).collect();
    for (param, data) in restored.parameters_mut().iter_mut().zip(saved) {
        *param.data_mut() = data;
    }

    let b = batch();
    let x = trained.forward(0, b.image(0), b.image(1), 0.4).unwrap();
    let y = restored.forward(0, b.image(0), b.image(1), 0.4).unwrap();
    assert_eq!(x.mask, y.mask);
    assert_eq!(x.logits, y.logits);
    assert!(x.mask.iter().all(|v| (0.0..=1.0).contains(v)));
}
