//! Deterministic quality scoring.
//!
//! The score is the sum of four independent sub-scores:
//!
//! | Sub-score    | Max | Signal                                   |
//! |--------------|-----|------------------------------------------|
//! | length       | 20  | word count against the configured bands  |
//! | fallback     | 40  | average fallback level of capabilities   |
//! | confidence   | 30  | average confidence of produced variables |
//! | completeness | 10  | no unresolved placeholders               |
//!
//! Pure: the same inputs always give the same breakdown.

use serde::{Deserialize, Serialize};

use crate::capability::{MAX_CONFIDENCE, MAX_FALLBACK_LEVEL, MIN_CONFIDENCE};
use crate::config::ScoringConfig;

pub const LENGTH_MAX: f64 = 20.0;
pub const FALLBACK_MAX: f64 = 40.0;
pub const CONFIDENCE_MAX: f64 = 30.0;
pub const COMPLETENESS_MAX: f64 = 10.0;

/// Everything the scorer looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreInputs {
    pub word_count: usize,
    /// One entry per capability expected for the entity. Capabilities that
    /// produced nothing should be passed as level 4.
    pub fallback_levels: Vec<u8>,
    /// One entry per capability-produced variable.
    pub confidence_scores: Vec<u8>,
    pub completeness_defect: bool,
}

/// Sub-scores and their rounded, clamped total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub length: f64,
    pub fallback: f64,
    pub confidence: f64,
    pub completeness: f64,
    pub total: u8,
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Compute the quality breakdown.
pub fn score(inputs: &ScoreInputs, config: &ScoringConfig) -> QualityBreakdown {
    let length = length_score(inputs.word_count, config);
    let fallback = fallback_score(&inputs.fallback_levels);
    let confidence = confidence_score(&inputs.confidence_scores);
    let completeness = if inputs.completeness_defect {
        0.0
    } else {
        COMPLETENESS_MAX
    };

    let total = (length + fallback + confidence + completeness)
        .round()
        .clamp(0.0, 100.0) as u8;

    QualityBreakdown {
        length,
        fallback,
        confidence,
        completeness,
        total,
    }
}

fn length_score(words: usize, config: &ScoringConfig) -> f64 {
    let (ideal_lo, ideal_hi) = config.ideal_words;
    let (ok_lo, ok_hi) = config.acceptable_words;

    if (ideal_lo..=ideal_hi).contains(&words) {
        return LENGTH_MAX;
    }
    if !(ok_lo..=ok_hi).contains(&words) {
        return 0.0;
    }
    let distance = if words < ideal_lo {
        ideal_lo - words
    } else {
        words - ideal_hi
    };
    if distance <= config.near_band_words {
        15.0
    } else {
        10.0
    }
}

/// Linear: average level 1 (or better) earns the full 40, level 4 earns 0.
fn fallback_score(levels: &[u8]) -> f64 {
    let worst = f64::from(MAX_FALLBACK_LEVEL);
    let avg = if levels.is_empty() {
        worst
    } else {
        levels
            .iter()
            .map(|l| f64::from((*l).min(MAX_FALLBACK_LEVEL)))
            .sum::<f64>()
            / levels.len() as f64
    };
    (FALLBACK_MAX * (worst - avg) / (worst - 1.0)).clamp(0.0, FALLBACK_MAX)
}

fn confidence_score(scores: &[u8]) -> f64 {
    let avg = if scores.is_empty() {
        f64::from(MIN_CONFIDENCE)
    } else {
        scores
            .iter()
            .map(|s| f64::from((*s).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)))
            .sum::<f64>()
            / scores.len() as f64
    };
    (avg * CONFIDENCE_MAX / f64::from(MAX_CONFIDENCE)).clamp(0.0, CONFIDENCE_MAX)
}
