use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{
    boundary::{Criterion, PretrainingOutput},
    errors::ForwardError,
    hooks::{ForwardHook, HookFilter},
};

pub const IGNORE_INDEX: i64 = -1;

/// Masked-LM plus next-sentence cross entropy. Targets equal to
/// [`IGNORE_INDEX`] contribute nothing to either term.
#[derive(Debug, Clone)]
pub struct BertPretrainingCriterion {
    vocab_size: usize,
    hooks: HookFilter,
}

impl BertPretrainingCriterion {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hooks: HookFilter::none(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookFilter) -> Self {
        self.hooks = hooks;
        self
    }

    /// Name under which the criterion exposes its hook point.
    pub fn hook_point(&self) -> &'static str {
        "loss_fn"
    }
}

impl Criterion for BertPretrainingCriterion {
    fn loss(
        &self,
        output: &PretrainingOutput,
        masked_lm_labels: &Tensor,
        next_sentence_labels: &Tensor,
        hook: &dyn ForwardHook,
    ) -> Result<Tensor, ForwardError> {
        let masked_lm_loss =
            cross_entropy(&output.prediction_scores, masked_lm_labels, self.vocab_size)?;
        self.hooks.fire(self.hook_point(), hook)?;
        let next_sentence_loss =
            cross_entropy(&output.seq_relationship_score, next_sentence_labels, 2)?;
        self.hooks.fire(self.hook_point(), hook)?;
        Ok((masked_lm_loss + next_sentence_loss)?)
    }
}

/// Mean negative log-likelihood over the targets that are not [`IGNORE_INDEX`].
/// Returns a zero that still belongs to the graph when every target is ignored.
pub fn cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    classes: usize,
) -> candle_core::Result<Tensor> {
    let logits = logits.reshape(((), classes))?;
    let targets = targets.to_dtype(DType::I64)?.flatten_all()?;
    let rows = logits.dim(0)?;
    if targets.dim(0)? != rows {
        candle_core::bail!(
            "cross entropy target count {} does not match {} logit rows",
            targets.dim(0)?,
            rows
        );
    }

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let valid = targets.ne(IGNORE_INDEX)?.to_dtype(DType::F32)?;
    let safe_targets = targets.maximum(0i64)?.to_dtype(DType::U32)?;
    let nll = log_probs
        .gather(&safe_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;

    let counted = valid.sum_all()?.to_vec0::<f32>()?;
    let total = (nll * valid)?.sum_all()?;
    total.affine(1.0 / f64::from(counted.max(1.0)), 0.0)
}
