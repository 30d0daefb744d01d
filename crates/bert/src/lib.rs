//! Compact BERT pretraining network plus the contract a training driver uses
//! to run it: inputs/outputs, forward instrumentation hooks, and the model and
//! criterion traits.

pub mod boundary;
pub mod config;
pub mod criterion;
pub mod errors;
pub mod hooks;
pub mod modeling;
mod norm;

pub use boundary::{Criterion, PretrainingInputs, PretrainingModel, PretrainingOutput};
pub use config::BertConfig;
pub use criterion::BertPretrainingCriterion;
pub use errors::{ForwardError, ModelError};
pub use hooks::{ForwardHook, HookFilter, Interrupted, NoHook, DEFAULT_HOOKED_MODULES};
pub use modeling::BertForPreTraining;
