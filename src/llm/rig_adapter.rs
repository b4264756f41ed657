//! Bridge from rig-core completion models to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs::model_cost;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Anthropic rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Adapts any rig `CompletionModel` to the engine's provider trait.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut preamble = Vec::new();
        let mut history = Vec::new();
        for message in request.messages {
            match message.role {
                Role::System => preamble.push(message.content),
                Role::User => history.push(Message::user(message.content)),
                Role::Assistant => history.push(Message::assistant(message.content)),
            }
        }

        let prompt = history.pop().ok_or_else(|| LlmError::InvalidResponse {
            provider: self.model_name.clone(),
            reason: "completion request has no user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        builder = builder.max_tokens(
            request
                .max_tokens
                .map(u64::from)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        );

        let response = builder.send().await.map_err(|e| {
            let reason = e.to_string();
            if reason.contains("429") || reason.to_ascii_lowercase().contains("rate limit") {
                LlmError::RateLimited {
                    provider: self.model_name.clone(),
                    retry_after: None,
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.model_name.clone(),
                    reason,
                }
            }
        })?;

        let content = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let output_tokens = response.usage.output_tokens as u32;
        let finish_reason = match request.max_tokens {
            Some(max) if output_tokens >= max => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}
