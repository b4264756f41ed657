//! Per-token prices for known models, used for campaign cost estimates.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD price per token for a model name.
///
/// Matches on model family prefixes; unknown models fall back to the
/// mid-tier price so estimates stay conservative.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if model.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if model.starts_with("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if model.starts_with("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_families() {
        assert_eq!(model_cost("claude-sonnet-4-20250514").0, dec!(0.000003));
        assert_eq!(model_cost("claude-3-5-haiku-latest").1, dec!(0.000004));
        assert_eq!(model_cost("gpt-4o-mini").0, dec!(0.00000015));
        assert_eq!(model_cost("gpt-4o").0, dec!(0.0000025));
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(model_cost("some-local-model"), model_cost("claude-sonnet"));
    }
}
