//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Placeholder replacement for variables that could not be resolved.
pub const DEFAULT_SENTINEL: &str = "UNAVAILABLE";

/// What the regeneration loop does with a below-threshold attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationStrategy {
    /// Validate the validator's corrected text as the next attempt. Never
    /// re-runs capabilities: without a usable correction the loop stops.
    AdoptCorrection,
    /// Re-run the capabilities with the issue list appended to the directives.
    Regenerate,
    /// Adopt the correction when it changes something, otherwise regenerate.
    #[default]
    Auto,
}

impl FromStr for RegenerationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adopt_correction" | "correct" => Ok(Self::AdoptCorrection),
            "regenerate" => Ok(Self::Regenerate),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown regeneration strategy '{other}'")),
        }
    }
}

/// Word-count bands for the length sub-score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Inclusive ideal word-count band (full 20 points).
    pub ideal_words: (usize, usize),
    /// Inclusive acceptable band (10 or 15 points).
    pub acceptable_words: (usize, usize),
    /// Distance from the ideal band that still earns 15 instead of 10.
    pub near_band_words: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ideal_words: (50, 125),
            acceptable_words: (30, 200),
            near_band_words: 20,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Validator score an attempt must reach to be accepted.
    pub quality_threshold: u8,
    /// Maximum number of validated attempts per entity.
    pub max_attempts: u32,
    /// Default timeout for a single capability call.
    pub capability_timeout: Duration,
    /// Timeout for a single validator call.
    pub validator_timeout: Duration,
    /// Size of the inter-entity worker pool.
    pub max_concurrent_entities: usize,
    /// In-flight calls allowed per capability provider.
    pub provider_max_concurrent: usize,
    /// Requests per minute per provider (0 = no spacing).
    pub provider_requests_per_minute: u32,
    /// Retry behaviour for below-threshold attempts.
    pub strategy: RegenerationStrategy,
    /// Replacement text for unresolved placeholders.
    pub sentinel: String,
    /// Length sub-score bands.
    pub scoring: ScoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 95,
            max_attempts: 3,
            capability_timeout: Duration::from_secs(30),
            validator_timeout: Duration::from_secs(60),
            max_concurrent_entities: 4,
            provider_max_concurrent: 4,
            provider_requests_per_minute: 0,
            strategy: RegenerationStrategy::Auto,
            sentinel: DEFAULT_SENTINEL.to_string(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `OUTREACH_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let quality_threshold: u8 =
            env_parse("OUTREACH_QUALITY_THRESHOLD")?.unwrap_or(defaults.quality_threshold);
        if quality_threshold > 100 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_QUALITY_THRESHOLD".to_string(),
                message: format!("{quality_threshold} is above 100"),
            });
        }

        let max_attempts: u32 =
            env_parse("OUTREACH_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let max_concurrent_entities: usize = env_parse("OUTREACH_MAX_CONCURRENT_ENTITIES")?
            .unwrap_or(defaults.max_concurrent_entities)
            .max(1);
        let provider_max_concurrent: usize = env_parse("OUTREACH_PROVIDER_MAX_CONCURRENT")?
            .unwrap_or(defaults.provider_max_concurrent)
            .max(1);

        Ok(Self {
            quality_threshold,
            max_attempts,
            capability_timeout: env_parse("OUTREACH_CAPABILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.capability_timeout),
            validator_timeout: env_parse("OUTREACH_VALIDATOR_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.validator_timeout),
            max_concurrent_entities,
            provider_max_concurrent,
            provider_requests_per_minute: env_parse("OUTREACH_PROVIDER_RPM")?
                .unwrap_or(defaults.provider_requests_per_minute),
            strategy: env_parse("OUTREACH_REGENERATION_STRATEGY")?.unwrap_or(defaults.strategy),
            ..defaults
        })
    }
}

/// Read and parse an optional environment variable.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}
