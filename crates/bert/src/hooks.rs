//! Instrumentation points inside a forward pass.
//!
//! A model names its sub-modules (`bert.embeddings`, `bert.encoder.layer.3`,
//! ...). A [`HookFilter`] decides which of those names fire, and a
//! [`ForwardHook`] receives `<module>_fwd` after the sub-module finishes. A
//! hook may return [`Interrupted`] to stop the pass; the model propagates it
//! unchanged to its caller.

use regex::Regex;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_HOOKED_MODULES: [&str; 4] = [
    "bert.embeddings",
    r"bert.encoder.layer.\d+",
    "bert.pooler",
    "loss_fn",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("computation interrupted after {label}")]
pub struct Interrupted {
    pub label: String,
}

pub trait ForwardHook {
    fn on_forward(&self, label: &str) -> Result<(), Interrupted>;
}

/// Hook that never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl ForwardHook for NoHook {
    fn on_forward(&self, _label: &str) -> Result<(), Interrupted> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HookFilter {
    expression: Option<Regex>,
}

impl HookFilter {
    /// Compiles `patterns` into one expression that must match a module name in full.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        if patterns.is_empty() {
            return Ok(Self::none());
        }
        let joined = patterns
            .iter()
            .map(|pattern| format!("(?:{})", pattern.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        let expression = Regex::new(&format!("^(?:{joined})$"))?;
        Ok(Self {
            expression: Some(expression),
        })
    }

    pub fn none() -> Self {
        Self { expression: None }
    }

    pub fn matches(&self, module: &str) -> bool {
        self.expression
            .as_ref()
            .map_or(false, |expression| expression.is_match(module))
    }

    /// Logs every hooked module name in `modules` and returns the matches.
    pub fn announce<'a>(&self, modules: &'a [String]) -> Vec<&'a str> {
        let hooked: Vec<&str> = modules
            .iter()
            .map(String::as_str)
            .filter(|name| self.matches(name))
            .collect();
        for name in &hooked {
            info!(module = %name, "hooking module");
        }
        hooked
    }

    pub fn fire(&self, module: &str, hook: &dyn ForwardHook) -> Result<(), Interrupted> {
        if self.matches(module) {
            hook.on_forward(&format!("{module}_fwd"))
        } else {
            Ok(())
        }
    }
}

impl Default for HookFilter {
    fn default() -> Self {
        // The default patterns are static and known to compile.
        Self::new(&DEFAULT_HOOKED_MODULES).unwrap_or_else(|_| Self::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        seen: RefCell<Vec<String>>,
        stop_at: Option<&'static str>,
    }

    impl ForwardHook for Recorder {
        fn on_forward(&self, label: &str) -> Result<(), Interrupted> {
            self.seen.borrow_mut().push(label.to_string());
            if self.stop_at == Some(label) {
                return Err(Interrupted {
                    label: label.to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn default_patterns_full_match() {
        let filter = HookFilter::default();
        assert!(filter.matches("bert.embeddings"));
        assert!(filter.matches("bert.encoder.layer.11"));
        assert!(filter.matches("bert.pooler"));
        assert!(filter.matches("loss_fn"));
        assert!(!filter.matches("bert.encoder.layer.1.attention"));
        assert!(!filter.matches("cls.predictions"));
    }

    #[test]
    fn fire_appends_suffix_and_propagates_interrupt() {
        let filter = HookFilter::default();
        let hook = Recorder {
            seen: RefCell::new(Vec::new()),
            stop_at: Some("bert.encoder.layer.0_fwd"),
        };
        filter.fire("bert.embeddings", &hook).unwrap();
        filter.fire("cls.predictions", &hook).unwrap();
        let err = filter.fire("bert.encoder.layer.0", &hook).unwrap_err();
        assert_eq!(err.label, "bert.encoder.layer.0_fwd");
        assert_eq!(
            hook.seen.into_inner(),
            vec!["bert.embeddings_fwd", "bert.encoder.layer.0_fwd"]
        );
    }

    #[test]
    fn empty_filter_never_fires() {
        let filter = HookFilter::new::<&str>(&[]).unwrap();
        assert!(!filter.matches("bert.embeddings"));
    }
}
