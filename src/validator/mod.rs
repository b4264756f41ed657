//! Artifact validators.
//!
//! A validator scores generated text and may propose a corrected version.
//! The regeneration loop decides what to do with the verdict.

pub mod llm;
pub mod rules;

pub use llm::LlmValidator;
pub use rules::RuleValidator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::UsageEstimate;
use crate::engine::types::Entity;
use crate::error::ValidatorError;

/// A validator's verdict on one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    /// 0-100.
    pub quality_score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    /// Proposed fix; empty when the validator has none.
    #[serde(default)]
    pub corrected_text: String,
    #[serde(default)]
    pub usage: UsageEstimate,
}

impl ValidationReport {
    /// Corrected text, when it is non-empty and differs from `current`.
    pub fn usable_correction(&self, current: &str) -> Option<&str> {
        let corrected = self.corrected_text.trim();
        (!corrected.is_empty() && corrected != current.trim()).then_some(corrected)
    }
}

/// External judge of artifact quality.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Score `text` generated for `entity`. `source_text` is the template
    /// the text was filled from, when available.
    async fn validate(
        &self,
        text: &str,
        entity: &Entity,
        source_text: Option<&str>,
    ) -> Result<ValidationReport, ValidatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_must_change_something() {
        let report = ValidationReport {
            corrected_text: "  Hello Ada  ".into(),
            ..ValidationReport::default()
        };
        assert_eq!(report.usable_correction("Hello Ada"), None);
        assert_eq!(report.usable_correction("hello ada"), Some("Hello Ada"));

        let empty = ValidationReport::default();
        assert_eq!(empty.usable_correction("anything"), None);
    }
}
