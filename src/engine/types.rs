//! Shared types for the campaign engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::CapabilityKind;
use crate::context::UsageEstimate;
use crate::engine::scoring::QualityBreakdown;

// ── Entity ──────────────────────────────────────────────────────────

/// The company/contact being personalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Company name.
    pub name: String,
    /// Company domain or website URL.
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Free-form attributes (industry, size, notes...). Also usable as
    /// template variables.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            first_name: None,
            last_name: None,
            email: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_first_name(mut self, first_name: impl Into<String>) -> Self {
        self.first_name = Some(first_name.into());
        self
    }

    pub fn with_last_name(mut self, last_name: impl Into<String>) -> Self {
        self.last_name = Some(last_name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// "First Last" when at least one part is known.
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }

    /// Domain without scheme, `www.` prefix, path or trailing slash, lowercased.
    pub fn normalized_domain(&self) -> String {
        let lower = self.domain.trim().to_ascii_lowercase();
        let without_scheme = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))
            .unwrap_or(&lower);
        let without_www = without_scheme
            .strip_prefix("www.")
            .unwrap_or(without_scheme);
        without_www
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Cache identity: normalized name + normalized domain.
    pub fn identity_key(&self) -> String {
        let name = self
            .name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        format!("entity:{}|{}", name, self.normalized_domain())
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        if self.domain.trim().is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.normalized_domain())
        }
    }
}

// ── Campaign request ────────────────────────────────────────────────

/// Input for one campaign run. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRequest {
    /// Template with `{{variable}}` placeholders.
    pub template: String,
    pub entities: Vec<Entity>,
    /// Client-level directives shared by every entity.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Batch identifier; generated when blank.
    #[serde(default)]
    pub batch_id: String,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
}

fn default_cache_enabled() -> bool {
    true
}

impl CampaignRequest {
    pub fn new(template: impl Into<String>, entities: Vec<Entity>) -> Self {
        Self {
            template: template.into(),
            entities,
            context: BTreeMap::new(),
            batch_id: String::new(),
            cache_enabled: true,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = batch_id.into();
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }
}

// ── Artifact ────────────────────────────────────────────────────────

/// One generated document plus its metadata, for one entity and attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub entity: Entity,
    /// 1-based attempt that produced this artifact.
    pub attempt: u32,
    pub text: String,
    /// Full variable map used for substitution.
    pub variables: BTreeMap<String, String>,
    /// Deterministic engine score (0-100).
    pub quality_score: u8,
    pub breakdown: QualityBreakdown,
    pub fallback_levels: BTreeMap<CapabilityKind, u8>,
    pub confidence_scores: BTreeMap<String, u8>,
    /// Placeholders replaced with the sentinel.
    pub completeness_defects: Vec<String>,
    /// Score returned by the validator, once validated.
    pub validation_score: Option<u8>,
    pub is_valid: bool,
    pub issues: Vec<String>,
    /// Variables came from the result cache.
    pub cache_hit: bool,
    pub generation_time_ms: u64,
    pub usage: UsageEstimate,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Unscored, unvalidated artifact.
    pub fn new(entity: Entity, attempt: u32, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            attempt,
            text: text.into(),
            variables: BTreeMap::new(),
            quality_score: 0,
            breakdown: QualityBreakdown::default(),
            fallback_levels: BTreeMap::new(),
            confidence_scores: BTreeMap::new(),
            completeness_defects: Vec::new(),
            validation_score: None,
            is_valid: false,
            issues: Vec::new(),
            cache_hit: false,
            generation_time_ms: 0,
            usage: UsageEstimate::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

// ── Campaign result ─────────────────────────────────────────────────

/// Aggregate over all entities of a campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResult {
    pub batch_id: String,
    pub artifacts: Vec<Artifact>,
    /// Entities submitted.
    pub total: usize,
    /// Entities whose artifact reached the quality threshold.
    pub success_count: usize,
    /// Entities whose retained artifact stayed below the threshold.
    pub exhausted_count: usize,
    /// Entities whose pipeline failed unexpectedly.
    pub failed_count: usize,
    /// Entities never dispatched because the campaign was cancelled.
    pub skipped_count: usize,
    pub success_rate: f64,
    /// Average engine quality score over successful entities.
    pub average_quality_score: f64,
    pub total_time_ms: u64,
    pub average_time_ms: f64,
    /// Capability invocations avoided by the cache / (total × capability count).
    pub cache_hit_rate: f64,
    /// Entities served from the cache.
    pub cache_reuse_count: usize,
    /// Capability results per fallback level.
    pub fallback_distribution: BTreeMap<u8, usize>,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub cancelled: bool,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CampaignResult {
    /// Entities that did not count as a clean success.
    pub fn unsuccessful_count(&self) -> usize {
        self.total - self.success_count
    }
}
