//! LLM-backed validator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::context::UsageEstimate;
use crate::engine::types::Entity;
use crate::error::ValidatorError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::validator::{ValidationReport, Validator};

const VALIDATION_TEMPERATURE: f32 = 0.0;
const VALIDATION_MAX_TOKENS: u32 = 1500;

const SYSTEM_PROMPT: &str = "You review personalized B2B outreach emails before they are sent.\n\
Score the email from 0 to 100 for correctness, personalization, tone and readability.\n\
Flag any placeholder text, generic filler, factual claims about the company that look \
invented, and grammar or formatting mistakes.\n\
If you can fix the problems without new facts, return the fixed email in corrected_text, \
otherwise return an empty string.\n\
Respond with ONLY a JSON object:\n\
{\"is_valid\": true, \"quality_score\": 0, \"issues\": [\"...\"], \"corrected_text\": \"...\"}";

/// Raw verdict as the model returns it.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    is_valid: Option<bool>,
    quality_score: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    corrected_text: Option<String>,
}

/// Validator that asks an LLM for a JSON verdict.
pub struct LlmValidator {
    llm: Arc<dyn LlmProvider>,
}

impl LlmValidator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn user_prompt(text: &str, entity: &Entity, source_text: Option<&str>) -> String {
        json!({
            "company": entity.name,
            "domain": entity.domain,
            "contact": entity.full_name(),
            "template": source_text,
            "email": text,
        })
        .to_string()
    }

    fn parse(raw: &str) -> Result<ValidationReport, ValidatorError> {
        let object = extract_json_object(raw)
            .ok_or_else(|| ValidatorError::InvalidResponse("no JSON object".to_string()))?;
        let verdict: RawVerdict = serde_json::from_str(object)
            .map_err(|e| ValidatorError::InvalidResponse(format!("malformed verdict: {e}")))?;

        if !verdict.quality_score.is_finite() {
            return Err(ValidatorError::InvalidResponse(
                "quality_score is not a number".to_string(),
            ));
        }
        let quality_score = verdict.quality_score.round().clamp(0.0, 100.0) as u8;

        Ok(ValidationReport {
            is_valid: verdict.is_valid.unwrap_or(verdict.issues.is_empty()),
            quality_score,
            issues: verdict.issues,
            corrected_text: verdict.corrected_text.unwrap_or_default(),
            usage: UsageEstimate::default(),
        })
    }
}

#[async_trait]
impl Validator for LlmValidator {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn validate(
        &self,
        text: &str,
        entity: &Entity,
        source_text: Option<&str>,
    ) -> Result<ValidationReport, ValidatorError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(Self::user_prompt(text, entity, source_text)),
        ])
        .with_temperature(VALIDATION_TEMPERATURE)
        .with_max_tokens(VALIDATION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let mut report = Self::parse(&response.content).inspect_err(|e| {
            warn!(entity = %entity.label(), error = %e, "Validator response unusable");
        })?;
        report.usage = UsageEstimate::from_tokens(
            u64::from(response.input_tokens),
            u64::from(response.output_tokens),
            self.llm.cost_per_token(),
        );

        debug!(
            entity = %entity.label(),
            score = report.quality_score,
            issues = report.issues.len(),
            "LLM validation"
        );
        Ok(report)
    }
}
