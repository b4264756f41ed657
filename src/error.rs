//! Error types for the outreach engine.

use std::time::Duration;

use crate::capability::CapabilityKind;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Validator error: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

/// Errors raised by a single capability invocation.
///
/// The scheduler never propagates these; they are converted into a
/// generic fallback output at fallback level 4.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability {capability} timed out after {timeout:?}")]
    Timeout {
        capability: CapabilityKind,
        timeout: Duration,
    },

    #[error("Capability {capability} failed: {reason}")]
    Failed {
        capability: CapabilityKind,
        reason: String,
    },

    #[error("Capability {capability} returned an unusable response: {reason}")]
    InvalidResponse {
        capability: CapabilityKind,
        reason: String,
    },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Capability registration and planning errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Capability {0} is already registered")]
    DuplicateCapability(CapabilityKind),

    #[error("Variable {variable} is already owned by {owner}, cannot register {capability}")]
    DuplicateOutput {
        variable: String,
        owner: CapabilityKind,
        capability: CapabilityKind,
    },

    #[error("Dependency cycle between capabilities: {0:?}")]
    Cycle(Vec<CapabilityKind>),

    #[error("No capabilities registered")]
    Empty,
}

/// Validator errors.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("Validator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Validator returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unexpected failure while processing one entity. Recorded in the
/// campaign result; the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("Validator error: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Invalid attempt state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Entity pipeline panicked: {0}")]
    Panicked(String),
}

/// Structural problems with a campaign request. Fatal: no entity is processed.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign template is empty")]
    EmptyTemplate,

    #[error("Campaign has no entities")]
    NoEntities,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
