//! LLM-backed capability.
//!
//! Sends the entity, the upstream variables and the campaign directives as a
//! JSON payload and expects a JSON object back:
//! `{"<field>": "...", "confidence_score": 1-5, "fallback_level": 0-4, "reasoning": "..."}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::capability::capability::{
    Capability, CapabilityInput, CapabilityKind, CapabilityOutput, MAX_FALLBACK_LEVEL,
    MIN_CONFIDENCE,
};
use crate::context::UsageEstimate;
use crate::error::CapabilityError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, LlmProvider, extract_json_object,
};

/// Temperature for extraction calls (kept low: these are lookups, not prose).
const EXTRACTION_TEMPERATURE: f32 = 0.2;

/// Max tokens for an extraction response.
const EXTRACTION_MAX_TOKENS: u32 = 600;

/// A capability implemented as a single structured LLM call.
pub struct PromptCapability {
    kind: CapabilityKind,
    llm: Arc<dyn LlmProvider>,
    instruction: String,
    provider: String,
    timeout: Option<Duration>,
}

impl PromptCapability {
    /// Create a prompt capability with the kind's default instruction.
    pub fn new(kind: CapabilityKind, llm: Arc<dyn LlmProvider>) -> Self {
        let provider = llm.model_name().to_string();
        Self {
            kind,
            llm,
            instruction: default_instruction(kind).to_string(),
            provider,
            timeout: None,
        }
    }

    /// Override the task instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Override the rate-limit bucket (defaults to the model name).
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn system_prompt(&self) -> String {
        let fields = self
            .kind
            .default_outputs()
            .iter()
            .map(|f| format!("\"{f}\": \"...\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{instruction}\n\n\
             Always answer, even with little evidence: use a higher fallback_level instead of refusing.\n\
             fallback_level: 0 = found in primary evidence, 4 = generic guess.\n\
             confidence_score: 1 = weak, 5 = strong.\n\
             Follow any directives given. Respond with ONLY a JSON object:\n\
             {{{fields}, \"confidence_score\": 1, \"fallback_level\": 4, \"reasoning\": \"...\"}}",
            instruction = self.instruction,
        )
    }

    fn user_prompt(&self, input: &CapabilityInput) -> String {
        json!({
            "company": input.entity.name,
            "domain": input.entity.domain,
            "contact": input.entity.full_name(),
            "attributes": input.entity.attributes,
            "upstream": input.variables,
            "directives": input.directives,
        })
        .to_string()
    }

    /// Parse the model's JSON answer into a typed output.
    fn parse_output(&self, raw: &str) -> Result<CapabilityOutput, CapabilityError> {
        let invalid = |reason: String| CapabilityError::InvalidResponse {
            capability: self.kind,
            reason,
        };

        let object = extract_json_object(raw).ok_or_else(|| invalid("no JSON object".into()))?;
        let value: Value =
            serde_json::from_str(object).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

        let confidence = value
            .get("confidence_score")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(MIN_CONFIDENCE))
            .min(255) as u8;
        let fallback = value
            .get("fallback_level")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(MAX_FALLBACK_LEVEL))
            .min(255) as u8;
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut output = CapabilityOutput::new(confidence, fallback, reasoning);
        for field in self.kind.default_outputs() {
            if let Some(text) = value.get(*field).and_then(Value::as_str) {
                output = output.with_field(*field, text.trim());
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Capability for PromptCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn execution_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, input: CapabilityInput) -> Result<CapabilityOutput, CapabilityError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(self.user_prompt(&input)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let usage = UsageEstimate::from_tokens(
            u64::from(response.input_tokens),
            u64::from(response.output_tokens),
            self.llm.cost_per_token(),
        );

        let output = self.parse_output(&response.content)?.with_usage(usage);
        debug!(
            capability = %self.kind,
            company = %input.entity.name,
            fallback_level = output.fallback_level,
            confidence = output.confidence_score,
            "Capability answered"
        );
        Ok(output)
    }
}

/// Short task statement per capability kind.
fn default_instruction(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Persona => {
            "Identify the most relevant buyer persona at this company for a B2B outreach email."
        }
        CapabilityKind::Competitor => {
            "Name the most likely competitor or incumbent vendor this company works with."
        }
        CapabilityKind::PainPoint => {
            "Identify the most pressing operational pain point this company likely has."
        }
        CapabilityKind::SocialProof => {
            "Pick the most relevant customer story or case study to mention to this company."
        }
        CapabilityKind::Signal => {
            "Find a recent buying signal (hiring, funding, launch, expansion) for this company, \
             relevant to the upstream persona and pain point."
        }
        CapabilityKind::TechStack => {
            "Name the system or tool this company most likely uses for the area of the upstream \
             pain point and signal."
        }
    }
}
