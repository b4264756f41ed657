//! Deterministic, local validator.
//!
//! Checks the things a reader notices first:
//! - unresolved placeholders (sentinel value or leftover braces)
//! - formatting slips (double spaces, space before punctuation, doubled
//!   words, lowercase opening)
//! - length outside the acceptable band
//! - the company name never mentioned
//!
//! Formatting slips are fixed in `corrected_text`; the rest needs a
//! regeneration.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::{DEFAULT_SENTINEL, EngineConfig};
use crate::engine::scoring::word_count;
use crate::engine::types::Entity;
use crate::error::ValidatorError;
use crate::validator::{ValidationReport, Validator};

const SENTINEL_PENALTY: u8 = 30;
const BRACES_PENALTY: u8 = 30;
const LENGTH_PENALTY: u8 = 15;
const COMPANY_PENALTY: u8 = 10;
const DOUBLED_WORD_PENALTY: u8 = 10;
const FORMAT_PENALTY: u8 = 5;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w']+\b").expect("valid word regex"));
static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid whitespace regex"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([,.!?;:])").expect("valid punctuation regex"));

/// Rule-based validator. Score is 100 minus the penalties of every rule
/// that fires.
#[derive(Debug, Clone)]
pub struct RuleValidator {
    sentinel: String,
    /// Inclusive acceptable word-count band.
    word_band: (usize, usize),
}

impl Default for RuleValidator {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            word_band: (30, 200),
        }
    }
}

impl RuleValidator {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            ..Self::default()
        }
    }

    /// Sentinel and length band taken from the engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sentinel: config.sentinel.clone(),
            word_band: config.scoring.acceptable_words,
        }
    }

    pub fn with_word_band(mut self, min: usize, max: usize) -> Self {
        self.word_band = (min, max);
        self
    }

    /// Run every rule and build the report.
    pub fn check(&self, text: &str, entity: &Entity) -> ValidationReport {
        let mut issues = Vec::new();
        let mut penalty: u32 = 0;
        let mut flag = |points: u8, issue: String| {
            penalty += u32::from(points);
            issues.push(issue);
        };

        if !self.sentinel.is_empty() && text.contains(&self.sentinel) {
            flag(
                SENTINEL_PENALTY,
                format!("Contains unresolved value '{}'", self.sentinel),
            );
        }
        if text.contains("{{") || text.contains("}}") {
            flag(BRACES_PENALTY, "Contains raw placeholder braces".to_string());
        }
        if MULTI_SPACE.is_match(text) {
            flag(FORMAT_PENALTY, "Repeated whitespace".to_string());
        }
        if SPACE_BEFORE_PUNCT.is_match(text) {
            flag(FORMAT_PENALTY, "Space before punctuation".to_string());
        }
        let (_, doubled) = remove_doubled_words(text);
        for word in doubled {
            flag(DOUBLED_WORD_PENALTY, format!("Doubled word '{word}'"));
        }
        if text
            .trim_start()
            .chars()
            .next()
            .is_some_and(char::is_lowercase)
        {
            flag(FORMAT_PENALTY, "Opens with a lowercase letter".to_string());
        }

        let words = word_count(text);
        let (min, max) = self.word_band;
        if !(min..=max).contains(&words) {
            flag(
                LENGTH_PENALTY,
                format!("Length of {words} words is outside {min}-{max}"),
            );
        }

        let company = entity.name.trim();
        if !company.is_empty() && !text.to_lowercase().contains(&company.to_lowercase()) {
            flag(COMPANY_PENALTY, format!("Never mentions {company}"));
        }

        let quality_score = 100u32.saturating_sub(penalty) as u8;
        let corrected = correct_formatting(text);
        debug!(
            entity = %entity.label(),
            score = quality_score,
            issues = issues.len(),
            "Rule validation"
        );

        ValidationReport {
            is_valid: issues.is_empty(),
            quality_score,
            issues,
            corrected_text: if corrected == text { String::new() } else { corrected },
            usage: Default::default(),
        }
    }
}

#[async_trait]
impl Validator for RuleValidator {
    fn name(&self) -> &str {
        "rules"
    }

    async fn validate(
        &self,
        text: &str,
        entity: &Entity,
        _source_text: Option<&str>,
    ) -> Result<ValidationReport, ValidatorError> {
        Ok(self.check(text, entity))
    }
}

/// Drop immediate case-insensitive repeats ("the the"). Returns the fixed
/// text and the repeated words found.
fn remove_doubled_words(text: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut doubled = Vec::new();
    let mut copied_to = 0;
    let mut prev: Option<(&str, usize)> = None;

    for m in WORD.find_iter(text) {
        let word = m.as_str();
        if let Some((prev_word, prev_end)) = prev {
            let gap = &text[prev_end..m.start()];
            let only_spaces = !gap.is_empty() && gap.chars().all(|c| c == ' ' || c == '\t');
            if only_spaces
                && word.chars().any(char::is_alphabetic)
                && prev_word.eq_ignore_ascii_case(word)
            {
                out.push_str(&text[copied_to..prev_end]);
                copied_to = m.end();
                prev = Some((prev_word, m.end()));
                doubled.push(word.to_lowercase());
                continue;
            }
        }
        prev = Some((word, m.end()));
    }
    out.push_str(&text[copied_to..]);
    (out, doubled)
}

/// Apply every formatting fix the rules know about.
fn correct_formatting(text: &str) -> String {
    let (deduped, _) = remove_doubled_words(text);
    let collapsed = MULTI_SPACE.replace_all(&deduped, " ");
    let punctuated = SPACE_BEFORE_PUNCT.replace_all(&collapsed, "$1");

    let trimmed = punctuated.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) if first.is_lowercase() => first.to_uppercase().chain(chars).collect(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> Entity {
        Entity::new("Acme", "acme.io")
    }

    /// `n` distinct filler words.
    fn words(n: usize) -> String {
        (0..n).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ")
    }

    fn clean_text() -> String {
        format!("Hi Ada, I noticed Acme is growing fast. {}", words(40))
    }

    #[test]
    fn clean_text_scores_100() {
        let report = RuleValidator::default().check(&clean_text(), &entity());
        assert_eq!(report.quality_score, 100);
        assert!(report.is_valid);
        assert!(report.issues.is_empty());
        assert!(report.corrected_text.is_empty());
    }

    #[test]
    fn sentinel_is_penalized_and_not_correctable() {
        let text = format!("Bonjour UNAVAILABLE, Acme is great. {}", words(40));
        let report = RuleValidator::default().check(&text, &entity());
        assert_eq!(report.quality_score, 100 - SENTINEL_PENALTY);
        assert!(!report.is_valid);
        assert!(report.usable_correction(&text).is_none());
    }

    #[test]
    fn formatting_slips_are_corrected() {
        let text = format!("hi Ada ,  the the Acme team. {}", words(40));
        let report = RuleValidator::default().check(&text, &entity());

        assert!(report.issues.iter().any(|i| i == "Doubled word 'the'"));
        assert!(report.issues.iter().any(|i| i == "Space before punctuation"));
        assert!(report.issues.iter().any(|i| i == "Repeated whitespace"));
        assert!(report.issues.iter().any(|i| i == "Opens with a lowercase letter"));
        assert_eq!(
            report.quality_score,
            100 - DOUBLED_WORD_PENALTY - 3 * FORMAT_PENALTY
        );
        assert_eq!(
            report.corrected_text,
            format!("Hi Ada, the Acme team. {}", words(40))
        );

        // The correction passes on its own.
        let second = RuleValidator::default().check(&report.corrected_text, &entity());
        assert_eq!(second.quality_score, 100);
    }

    #[test]
    fn length_and_company_checks() {
        let report = RuleValidator::default().check("Hello there.", &entity());
        assert_eq!(report.quality_score, 100 - LENGTH_PENALTY - COMPANY_PENALTY);

        let lenient = RuleValidator::default().with_word_band(1, 10);
        let report = lenient.check("Hello Acme.", &entity());
        assert_eq!(report.quality_score, 100);
    }

    #[test]
    fn doubled_words_across_punctuation_are_kept() {
        let (fixed, doubled) = remove_doubled_words("Yes. Yes, that that that works 1 1");
        assert_eq!(fixed, "Yes. Yes, that works 1 1");
        assert_eq!(doubled, vec!["that".to_string(), "that".to_string()]);
    }

    #[tokio::test]
    async fn validate_uses_check() {
        let validator = RuleValidator::new("N/A");
        let text = format!("N/A at Acme. {}", words(40));
        let report = validator.validate(&text, &entity(), None).await.unwrap();
        assert_eq!(report.quality_score, 100 - SENTINEL_PENALTY);
    }
}
