//! Shared campaign context and usage accounting.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Directive key under which validator feedback is passed to capabilities
/// on a regeneration attempt.
pub const FEEDBACK_DIRECTIVE: &str = "validator_feedback";

/// Client-level directives shared by every entity of a campaign.
///
/// Read-mostly: each regeneration attempt works on its own enriched copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Directives(BTreeMap<String, String>);

impl Directives {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of these directives with validator issues appended to the
    /// feedback directive.
    pub fn with_feedback(&self, issues: &[String]) -> Self {
        if issues.is_empty() {
            return self.clone();
        }
        let mut enriched = self.0.clone();
        let feedback = enriched.entry(FEEDBACK_DIRECTIVE.to_string()).or_default();
        for issue in issues {
            if !feedback.is_empty() {
                feedback.push('\n');
            }
            feedback.push_str("- ");
            feedback.push_str(issue);
        }
        Self(enriched)
    }
}

impl From<BTreeMap<String, String>> for Directives {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }
}

/// Token and cost estimate accumulated over LLM-backed calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

impl UsageEstimate {
    /// Estimate from token counts and per-token prices.
    pub fn from_tokens(
        input_tokens: u64,
        output_tokens: u64,
        (input_price, output_price): (Decimal, Decimal),
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost: input_price * Decimal::from(input_tokens)
                + output_price * Decimal::from(output_tokens),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for UsageEstimate {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost += rhs.cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn feedback_is_appended_not_replaced() {
        let mut base = BTreeMap::new();
        base.insert("tone".to_string(), "formal".to_string());
        let directives = Directives::new(base);

        let once = directives.with_feedback(&["too long".to_string()]);
        let twice = once.with_feedback(&["missing greeting".to_string()]);

        assert_eq!(twice.get("tone"), Some("formal"));
        assert_eq!(
            twice.get(FEEDBACK_DIRECTIVE),
            Some("- too long\n- missing greeting")
        );
        // The original is untouched.
        assert!(directives.get(FEEDBACK_DIRECTIVE).is_none());
    }

    #[test]
    fn usage_cost_from_prices() {
        let usage = UsageEstimate::from_tokens(1000, 200, (dec!(0.000003), dec!(0.000015)));
        assert_eq!(usage.cost, dec!(0.006));
        assert_eq!(usage.total_tokens(), 1200);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = UsageEstimate::default();
        total += UsageEstimate::from_tokens(10, 5, (dec!(0.1), dec!(0.2)));
        total += UsageEstimate::from_tokens(1, 1, (dec!(0.1), dec!(0.2)));
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.cost, dec!(2.3));
    }
}
