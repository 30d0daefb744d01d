use thiserror::Error;

use crate::hooks::Interrupted;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model config: {0}")]
    Config(String),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("invalid hook pattern: {0}")]
    HookPattern(#[from] regex::Error),
}

/// Failure of a forward pass. `Interrupted` is the cooperative stop raised by
/// an instrumentation hook and is expected to be handled by the caller.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("forward failed: {0}")]
    Candle(#[from] candle_core::Error),
}

impl ForwardError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ForwardError::Interrupted(_))
    }
}
