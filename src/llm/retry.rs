//! Retry wrapper for transient provider failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Backoff settings for [`RetryProvider`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Retries transient failures (`RequestFailed`, `RateLimited`) with
/// exponential backoff and jitter. Other errors are returned immediately.
pub struct RetryProvider {
    inner: Arc<dyn LlmProvider>,
    config: RetryConfig,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn delay_for(&self, attempt: u32, error: &LlmError) -> Duration {
        if let LlmError::RateLimited {
            retry_after: Some(after),
            ..
        } = error
        {
            return (*after).min(self.config.max_delay);
        }
        let exp = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_delay);
        let jitter_cap = (exp.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        (exp + Duration::from_millis(jitter)).min(self.config.max_delay)
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.delay_for(attempt, &e);
                    tracing::warn!(
                        model = self.inner.model_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient LLM failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{ChatMessage, FinishReason};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyLlm {
        failures_left: AtomicU32,
        calls: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl LlmProvider for FlakyLlm {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.transient {
                    LlmError::RequestFailed {
                        provider: "flaky".into(),
                        reason: "503".into(),
                    }
                } else {
                    LlmError::AuthFailed {
                        provider: "flaky".into(),
                    }
                });
            }
            Ok(CompletionResponse {
                content: "ok".into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let inner = Arc::new(FlakyLlm {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            transient: true,
        });
        let provider = RetryProvider::new(inner.clone(), fast_config());
        let response = provider.complete(request()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(FlakyLlm {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
            transient: true,
        });
        let provider = RetryProvider::new(inner.clone(), fast_config());
        assert!(provider.complete(request()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failures() {
        let inner = Arc::new(FlakyLlm {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            transient: false,
        });
        let provider = RetryProvider::new(inner.clone(), fast_config());
        assert!(matches!(
            provider.complete(request()).await,
            Err(LlmError::AuthFailed { .. })
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
