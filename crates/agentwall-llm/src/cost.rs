//! Static cost table (component C1).
//!
//! A single literal pricing map, loaded once at process startup — no
//! network fetches, ever. Lookup is exact match first, then a fuzzy
//! substring match (so `"gpt-4-0613"` still prices as `"gpt-4"`), then a
//! `default` entry. Prices are quoted per one million tokens.

use agentwall_core::Money;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::{info, warn};

/// (input price, output price), both quoted per one million tokens.
struct Pricing {
    input: Money,
    output: Money,
}

fn usd_per_million(v: f64) -> Money {
    Money::from_dollars_f64(v)
}

static PRICING: Lazy<HashMap<&'static str, Pricing>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "gpt-4",
        Pricing { input: usd_per_million(30.0), output: usd_per_million(60.0) },
    );
    m.insert(
        "gpt-4-turbo",
        Pricing { input: usd_per_million(10.0), output: usd_per_million(30.0) },
    );
    m.insert(
        "gpt-4-turbo-preview",
        Pricing { input: usd_per_million(10.0), output: usd_per_million(30.0) },
    );
    m.insert(
        "gpt-3.5-turbo",
        Pricing { input: usd_per_million(0.5), output: usd_per_million(1.5) },
    );
    m.insert(
        "gpt-3.5-turbo-16k",
        Pricing { input: usd_per_million(3.0), output: usd_per_million(4.0) },
    );
    m.insert(
        "claude-3-opus",
        Pricing { input: usd_per_million(15.0), output: usd_per_million(75.0) },
    );
    m.insert(
        "claude-3-sonnet",
        Pricing { input: usd_per_million(3.0), output: usd_per_million(15.0) },
    );
    m.insert(
        "claude-3-haiku",
        Pricing { input: usd_per_million(0.25), output: usd_per_million(1.25) },
    );
    m.insert(
        "gemini-pro",
        Pricing { input: usd_per_million(0.5), output: usd_per_million(1.5) },
    );
    m.insert(
        "default",
        Pricing { input: usd_per_million(1.0), output: usd_per_million(2.0) },
    );
    m
});

/// Resolve pricing for `model`: exact match, then the first catalog key
/// that appears as a substring of `model`, then `default`.
fn get_model_pricing(model: &str) -> &'static Pricing {
    if let Some(p) = PRICING.get(model) {
        return p;
    }
    for (key, pricing) in PRICING.iter() {
        if *key != "default" && model.contains(key) {
            info!(model, matched = key, "fuzzy matched model to cost table entry");
            return pricing;
        }
    }
    warn!(model, "unknown model, using default pricing");
    PRICING.get("default").expect("default pricing entry must exist")
}

/// Cost of one completion: `(prompt_tokens * input_price + completion_tokens
/// * output_price) / 1_000_000`, computed in fixed-point throughout.
///
/// Finite and non-negative for any non-negative token counts; zero tokens
/// in both counts yields exactly zero.
pub fn calculate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Money {
    let pricing = get_model_pricing(model);
    Money::token_cost(prompt_tokens, pricing.input) + Money::token_cost(completion_tokens, pricing.output)
}

/// Fallback token estimate for streaming responses when upstream never
/// reports a `usage` frame: `tokens ≈ words × 1.3`. Prefer upstream-reported
/// usage whenever present; this estimate is only a last resort.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    (words * 1.3).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_is_zero_cost() {
        assert_eq!(calculate_cost("gpt-4", 0, 0), Money::ZERO);
    }

    #[test]
    fn exact_match_prices_gpt4() {
        let cost = calculate_cost("gpt-4", 1_000_000, 0);
        assert_eq!(cost, Money::from_dollars_f64(30.0));
    }

    #[test]
    fn fuzzy_match_on_dated_model_suffix() {
        let cost = calculate_cost("gpt-4-0613", 1_000_000, 0);
        assert_eq!(cost, Money::from_dollars_f64(30.0));
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let cost = calculate_cost("some-brand-new-model", 1_000_000, 0);
        assert_eq!(cost, Money::from_dollars_f64(1.0));
    }

    #[test]
    fn cost_is_monotone_in_token_counts() {
        let low = calculate_cost("gpt-4", 100, 50);
        let high = calculate_cost("gpt-4", 200, 50);
        assert!(high > low);
    }

    #[test]
    fn estimate_tokens_scales_with_word_count() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("one two three four five") > 5);
    }
}
