use candle_core::{Tensor, Var};

use crate::{errors::ForwardError, hooks::ForwardHook};

/// One micro-batch as the network sees it. All tensors are `[batch, seq]`
/// integer tensors except `next_sentence_positions`, which is `[batch, P]`.
#[derive(Debug, Clone)]
pub struct PretrainingInputs {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
    /// Per-token position ids for packed sequences.
    pub positions: Option<Tensor>,
    /// Indices of the `[CLS]` token of every packed sequence.
    pub next_sentence_positions: Option<Tensor>,
}

impl PretrainingInputs {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn sequence_length(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }

    pub fn is_packed(&self) -> bool {
        self.positions.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PretrainingOutput {
    /// `[batch, seq, vocab]`
    pub prediction_scores: Tensor,
    /// `[batch, 2]`, or `[batch, P, 2]` for packed inputs.
    pub seq_relationship_score: Tensor,
}

/// The network side of the training boundary.
pub trait PretrainingModel {
    /// Trainable parameters sorted by name. Every replica must return the same
    /// order so flattened gradients line up across participants.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Names of the sub-modules that can carry a forward hook.
    fn hook_points(&self) -> Vec<String>;

    fn forward(
        &self,
        inputs: &PretrainingInputs,
        hook: &dyn ForwardHook,
    ) -> Result<PretrainingOutput, ForwardError>;
}

pub trait Criterion {
    /// Scalar training loss for one micro-batch.
    fn loss(
        &self,
        output: &PretrainingOutput,
        masked_lm_labels: &Tensor,
        next_sentence_labels: &Tensor,
        hook: &dyn ForwardHook,
    ) -> Result<Tensor, ForwardError>;
}
