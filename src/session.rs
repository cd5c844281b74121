//! One mixed training step against an external classifier
//!
//! The step order is fixed: dispatch, classifier forward, attention
//! relabeling, classifier backward, mix block update, classifier update. The
//! classifier and the mix block never share parameters or optimizer state.

use crate::batch::ImageBatch;
use crate::error::Result;
use crate::metadata::MixMetadata;
use crate::mixblock::{MixBlockReport, MixSignal};
use crate::mixer::{
    mask_gradients, relabel_with_attention, AreaWeightedAttention, AttentionMap,
    AttentionWeighting, MixedLabels,
};
use crate::policy::{MixDispatcher, PolicyId};
use ndarray::{Array2, Array4};
use tracing::debug;

/// Classifier output for a mixed batch
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Shape (N, K)
    pub logits: Array2<f32>,
    /// Patch attention, required for attention relabeling
    pub attention: Option<AttentionMap>,
}

/// Classifier loss and the gradient with respect to its input
#[derive(Debug, Clone)]
pub struct BackwardPass {
    pub loss: f32,
    /// dL/d(mixed images), shape (N, C, H, W); drives learned policies
    pub input_grad: Option<Array4<f32>>,
}

/// The host's model as seen by a mixing step
pub trait MixClassifier {
    /// Run the model on mixed images. ManifoldMix and AlignMix batches arrive
    /// unmixed with `metadata.feature_layer` set; the model mixes that layer
    /// with [`crate::mixer::mix_features`], or with
    /// [`crate::mixer::mix_aligned_features`] when `metadata.alignment` is set.
    fn forward(&mut self, images: &Array4<f32>, metadata: &MixMetadata) -> Result<ForwardPass>;

    /// Loss against the mixed targets and gradients for the model's own
    /// parameters, not yet applied
    fn backward(&mut self, pass: &ForwardPass, labels: &MixedLabels) -> Result<BackwardPass>;

    /// Apply the gradients computed by the last backward
    fn apply_gradients(&mut self) -> Result<()>;
}

/// Outcome of [`MixSession::step`]
#[derive(Debug, Clone)]
pub struct StepReport {
    pub policy: PolicyId,
    pub step: u64,
    pub loss: f32,
    /// Mean ratio the labels were mixed with
    pub mean_ratio: f32,
    /// Labels were recomputed from attention
    pub relabeled: bool,
    pub budget_exhausted: bool,
    /// Present when the mix block took a gradient step
    pub block: Option<MixBlockReport>,
}

/// Dispatcher plus the attention weighting, driving one step at a time
pub struct MixSession {
    dispatcher: MixDispatcher,
    attention: Box<dyn AttentionWeighting>,
}

impl MixSession {
    pub fn new(dispatcher: MixDispatcher) -> Self {
        Self {
            dispatcher,
            attention: Box::new(AreaWeightedAttention),
        }
    }

    /// Replace the default area-weighted attention relabeling
    pub fn with_attention_weighting(mut self, weighting: Box<dyn AttentionWeighting>) -> Self {
        self.attention = weighting;
        self
    }

    pub fn dispatcher(&self) -> &MixDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut MixDispatcher {
        &mut self.dispatcher
    }

    /// Mix `batch`, run the model on it and update both parameter sets
    pub fn step<M: MixClassifier + ?Sized>(
        &mut self,
        batch: &ImageBatch,
        model: &mut M,
    ) -> Result<StepReport> {
        let mut output = self.dispatcher.next(batch)?;
        let policy = output.metadata.policy;

        let pass = model.forward(&output.images, &output.metadata)?;

        let mut relabeled = false;
        if policy.uses_attention() {
            if let Some(attention) = pass.attention.as_ref() {
                let (labels, ratios) = relabel_with_attention(
                    &output.metadata,
                    batch.labels(),
                    attention,
                    self.attention.as_ref(),
                    self.dispatcher.label_options(),
                )?;
                output.labels = labels;
                output.metadata.ratios = ratios;
                relabeled = true;
            }
        }

        let grads = model.backward(&pass, &output.labels)?;

        let mut block_report = None;
        if policy.is_learned() {
            if let Some(block) = self.dispatcher.mix_block_mut() {
                if block.should_update(output.metadata.step) {
                    let mask_grads = match grads.input_grad.as_ref() {
                        Some(g) => mask_gradients(batch, &output.metadata, g)?,
                        None => Vec::new(),
                    };
                    block_report = Some(block.update(&MixSignal { mask_grads })?);
                } else {
                    block.discard_pending();
                }
            }
        }

        model.apply_gradients()?;

        let report = StepReport {
            policy,
            step: output.metadata.step,
            loss: grads.loss,
            mean_ratio: output.metadata.mean_ratio(),
            relabeled,
            budget_exhausted: output.metadata.budget_exhausted,
            block: block_report,
        };
        debug!(
            policy = %report.policy,
            step = report.step,
            loss = report.loss,
            relabeled = report.relabeled,
            block_updated = report.block.is_some(),
            "mix step complete"
        );
        Ok(report)
    }
}
