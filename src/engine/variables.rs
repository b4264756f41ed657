//! Variable store and template substitution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityKind;
use crate::engine::types::Entity;

/// Well-formed placeholder: `{{ name }}`.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("valid placeholder regex")
});

/// Anything still shaped like a placeholder after substitution, braces
/// inside included. Shortest span, so two residuals never swallow the text
/// between them.
static RESIDUAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{.*?\}\}").expect("valid residual regex"));

/// Unpaired delimiters left after the residual pass.
static STRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}").expect("valid stray regex"));

/// Flat variable map for one entity, plus per-variable confidence and
/// per-capability fallback metadata.
///
/// First write wins: each capability owns disjoint names and entity base
/// fields are seeded before any capability runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMap {
    values: BTreeMap<String, String>,
    confidence: BTreeMap<String, u8>,
    fallback_levels: BTreeMap<CapabilityKind, u8>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map seeded with the entity's non-empty base fields and attributes.
    pub fn seeded(entity: &Entity) -> Self {
        let mut map = Self::new();
        map.insert("company_name", &entity.name);
        map.insert("domain", &entity.normalized_domain());
        if let Some(first) = &entity.first_name {
            map.insert("first_name", first);
        }
        if let Some(last) = &entity.last_name {
            map.insert("last_name", last);
        }
        if let Some(full) = entity.full_name() {
            map.insert("full_name", &full);
        }
        if let Some(email) = &entity.email {
            map.insert("email", email);
        }
        for (key, value) in &entity.attributes {
            map.insert(key, value);
        }
        map
    }

    /// Insert a value unless the name is taken or the value is blank.
    /// Returns whether the value was stored.
    pub fn insert(&mut self, name: &str, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() || self.values.contains_key(name) {
            return false;
        }
        self.values.insert(name.to_string(), value.to_string());
        true
    }

    /// Merge one capability's fields and metadata.
    pub fn merge_output(
        &mut self,
        kind: CapabilityKind,
        fields: &BTreeMap<String, String>,
        confidence_score: u8,
        fallback_level: u8,
    ) -> Vec<String> {
        let mut rejected = Vec::new();
        for (name, value) in fields {
            if self.insert(name, value) {
                self.confidence.insert(name.clone(), confidence_score);
            } else {
                rejected.push(name.clone());
            }
        }
        self.fallback_levels.entry(kind).or_insert(fallback_level);
        rejected
    }

    /// Only the capability-produced variables and their metadata, without
    /// the entity's base fields.
    pub fn derived(&self) -> VariableMap {
        let values = self
            .values
            .iter()
            .filter(|(name, _)| self.confidence.contains_key(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        VariableMap {
            values,
            confidence: self.confidence.clone(),
            fallback_levels: self.fallback_levels.clone(),
        }
    }

    /// Merge a derived map (e.g. from the cache) under first-write-wins.
    pub fn absorb(&mut self, other: &VariableMap) {
        for (name, value) in &other.values {
            if self.insert(name, value)
                && let Some(confidence) = other.confidence.get(name)
            {
                self.confidence.insert(name.clone(), *confidence);
            }
        }
        for (kind, level) in &other.fallback_levels {
            self.fallback_levels.entry(*kind).or_insert(*level);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Confidence per capability-produced variable.
    pub fn confidence_scores(&self) -> &BTreeMap<String, u8> {
        &self.confidence
    }

    /// Fallback level per capability that ran.
    pub fn fallback_levels(&self) -> &BTreeMap<CapabilityKind, u8> {
        &self.fallback_levels
    }
}

/// Result of filling a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub text: String,
    /// Placeholders that could not be resolved and became the sentinel.
    pub defects: Vec<String>,
}

impl Substitution {
    pub fn is_complete(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Names referenced by well-formed placeholders, in first-seen order.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Fill `template` from `variables` in a single, non-recursive pass.
///
/// Placeholders with no value, malformed placeholders, and placeholder
/// syntax carried in by a substituted value are all replaced with
/// `sentinel` and reported as defects. The returned text never contains
/// `{{...}}`.
pub fn substitute(template: &str, variables: &VariableMap, sentinel: &str) -> Substitution {
    let mut defects = Vec::new();

    let filled = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        }
    });

    let text = RESIDUAL
        .replace_all(&filled, |caps: &Captures| {
            let raw = &caps[0];
            let name = raw
                .trim_start_matches('{')
                .trim_end_matches('}')
                .trim()
                .to_string();
            defects.push(if name.is_empty() { raw.to_string() } else { name });
            sentinel.to_string()
        })
        .into_owned();

    let text = STRAY
        .replace_all(&text, |caps: &Captures| {
            defects.push(caps[0].to_string());
            sentinel.to_string()
        })
        .into_owned();

    Substitution { text, defects }
}
