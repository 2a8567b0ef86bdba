//! Document model seam
//!
//! The rich-text model (node/mark schema, step composition) lives outside
//! this crate. The relay only needs one capability from it: applying an
//! ordered list of steps to a content tree, used when folding the diff log
//! into the current document.

use serde_json::Value;
use thiserror::Error;

use pagesync_protocol::Step;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("step {index} does not apply: {reason}")]
    BadStep { index: usize, reason: String },
}

/// Applies steps to an opaque content tree.
///
/// Implementations must be deterministic: folding the same diff sequence
/// from the same starting content always yields the same result. That is
/// what makes the append-only log the source of truth for document content.
pub trait StepApplier: Send + Sync {
    fn apply(&self, content: &Value, steps: &[Step]) -> Result<Value, ApplyError>;
}

/// Minimal reference model: the document is a JSON string and each step is
/// `{ "from": usize, "to": usize, "insert": string }`, splicing the char
/// range `[from, to)`. Used by tests and as the default binary wiring; real
/// deployments plug in their own model.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceModel;

impl StepApplier for SpliceModel {
    fn apply(&self, content: &Value, steps: &[Step]) -> Result<Value, ApplyError> {
        // A fresh document (nothing committed yet) folds from null.
        let mut chars: Vec<char> = match content {
            Value::Null => Vec::new(),
            Value::String(s) => s.chars().collect(),
            other => {
                return Err(ApplyError::BadStep {
                    index: 0,
                    reason: format!("content is not a string: {other}"),
                })
            }
        };

        for (index, step) in steps.iter().enumerate() {
            let bad = |reason: &str| ApplyError::BadStep {
                index,
                reason: reason.to_string(),
            };
            let from = step.from_pos().ok_or_else(|| bad("missing from"))?;
            let to = step.to_pos().ok_or_else(|| bad("missing to"))?;
            let from = usize::try_from(from).map_err(|_| bad("from not addressable"))?;
            let to = usize::try_from(to).map_err(|_| bad("to not addressable"))?;
            let insert = step
                .as_value()
                .get("insert")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing insert"))?;
            if from > to || to > chars.len() {
                return Err(bad(&format!(
                    "range {from}..{to} outside document of length {}",
                    chars.len()
                )));
            }
            chars.splice(from..to, insert.chars());
        }

        Ok(Value::String(chars.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(from: usize, to: usize, insert: &str) -> Step {
        Step::new(json!({ "from": from, "to": to, "insert": insert }))
    }

    #[test]
    fn splice_from_empty() {
        let model = SpliceModel;
        let out = model.apply(&Value::Null, &[step(0, 0, "hello")]).unwrap();
        assert_eq!(out, json!("hello"));
    }

    #[test]
    fn splice_replaces_range() {
        let model = SpliceModel;
        let out = model
            .apply(&json!("hello world"), &[step(6, 11, "rust")])
            .unwrap();
        assert_eq!(out, json!("hello rust"));
    }

    #[test]
    fn steps_apply_in_order() {
        let model = SpliceModel;
        let out = model
            .apply(&json!("ab"), &[step(1, 1, "x"), step(3, 3, "y")])
            .unwrap();
        assert_eq!(out, json!("axby"));
    }

    #[test]
    fn oversized_position_is_rejected_not_truncated() {
        let model = SpliceModel;
        let huge = u64::from(u32::MAX) + 1;
        let err = model
            .apply(
                &json!("ab"),
                &[Step::new(json!({ "from": huge, "to": huge, "insert": "x" }))],
            )
            .unwrap_err();
        assert!(matches!(err, ApplyError::BadStep { index: 0, .. }));
    }

    #[test]
    fn out_of_bounds_step_fails() {
        let model = SpliceModel;
        let err = model.apply(&json!("ab"), &[step(1, 9, "x")]).unwrap_err();
        assert!(matches!(err, ApplyError::BadStep { index: 0, .. }));
    }
}
