//! Capability contract.
//!
//! A capability derives one or more variables for an entity. It always
//! returns a best-effort value; missing evidence is expressed as a higher
//! fallback level, never as an error. Only transport-level problems
//! (timeouts, upstream failures) surface as `Err`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{Directives, UsageEstimate};
use crate::engine::types::Entity;
use crate::error::CapabilityError;

/// Highest (worst) fallback level: a generic guess.
pub const MAX_FALLBACK_LEVEL: u8 = 4;
/// Lowest confidence score.
pub const MIN_CONFIDENCE: u8 = 1;
/// Highest confidence score.
pub const MAX_CONFIDENCE: u8 = 5;

/// Identifier of a capability, resolved once at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Persona,
    Competitor,
    PainPoint,
    SocialProof,
    Signal,
    TechStack,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 6] = [
        Self::Persona,
        Self::Competitor,
        Self::PainPoint,
        Self::SocialProof,
        Self::Signal,
        Self::TechStack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persona => "persona",
            Self::Competitor => "competitor",
            Self::PainPoint => "pain_point",
            Self::SocialProof => "social_proof",
            Self::Signal => "signal",
            Self::TechStack => "tech_stack",
        }
    }

    /// Variables this kind produces by default.
    pub fn default_outputs(&self) -> &'static [&'static str] {
        match self {
            Self::Persona => &["persona"],
            Self::Competitor => &["competitor"],
            Self::PainPoint => &["pain_point"],
            Self::SocialProof => &["case_study"],
            Self::Signal => &["signal"],
            Self::TechStack => &["tech_stack"],
        }
    }

    /// Upstream variables this kind reads by default.
    pub fn default_required_inputs(&self) -> &'static [&'static str] {
        match self {
            Self::Signal => &["persona", "pain_point"],
            Self::TechStack => &["signal", "pain_point"],
            _ => &[],
        }
    }

    /// Generic value for a field when nothing better is known.
    pub fn generic_value(&self, entity: &Entity) -> String {
        let company = if entity.name.trim().is_empty() {
            "your company"
        } else {
            entity.name.trim()
        };
        match self {
            Self::Persona => "the leadership team".to_string(),
            Self::Competitor => "other vendors in your space".to_string(),
            Self::PainPoint => "scaling operations without adding headcount".to_string(),
            Self::SocialProof => format!("teams similar to {company}"),
            Self::Signal => format!("the recent momentum at {company}"),
            Self::TechStack => "your current tooling".to_string(),
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed input for a capability call.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInput {
    pub entity: Entity,
    /// Required upstream variables. An absent upstream is an explicit empty string.
    pub variables: BTreeMap<String, String>,
    pub directives: Directives,
}

impl CapabilityInput {
    /// Value of an upstream variable, `None` when it is the empty placeholder.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Typed, confidence-annotated capability result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub fields: BTreeMap<String, String>,
    /// 1 (weak) to 5 (strong evidence).
    pub confidence_score: u8,
    /// 0 (primary evidence) to 4 (generic guess).
    pub fallback_level: u8,
    pub reasoning: String,
    #[serde(default)]
    pub usage: UsageEstimate,
}

impl CapabilityOutput {
    pub fn new(confidence_score: u8, fallback_level: u8, reasoning: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            confidence_score,
            fallback_level,
            reasoning: reasoning.into(),
            usage: UsageEstimate::default(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_usage(mut self, usage: UsageEstimate) -> Self {
        self.usage = usage;
        self
    }
}

/// Uniform interface every extraction unit implements.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry identifier.
    fn kind(&self) -> CapabilityKind;

    /// Rate-limit bucket for the external service behind this capability.
    fn provider(&self) -> &str {
        "default"
    }

    /// Variable names this capability reads from the variable map.
    fn required_inputs(&self) -> &[&'static str] {
        self.kind().default_required_inputs()
    }

    /// Variable names this capability owns.
    fn outputs(&self) -> &[&'static str] {
        self.kind().default_outputs()
    }

    /// Per-capability timeout; the engine default applies when `None`.
    fn execution_timeout(&self) -> Option<Duration> {
        None
    }

    /// Best-effort value for a field, used when the call fails.
    fn generic_fallback(&self, entity: &Entity, _field: &str) -> String {
        self.kind().generic_value(entity)
    }

    /// Derive this capability's variables for one entity.
    async fn run(&self, input: CapabilityInput) -> Result<CapabilityOutput, CapabilityError>;
}
