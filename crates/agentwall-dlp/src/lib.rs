//! Data-loss-prevention scanning (component C2).
//!
//! Pattern-matches an input string against a fixed catalog of secret/PII
//! shapes and either redacts, blocks, or silently records the match,
//! depending on the configured [`DlpMode`]. Patterns are compiled once at
//! startup (see [`patterns::PATTERNS`]) and are immutable thereafter, so
//! scanning never allocates beyond the output string.

pub mod patterns;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Deployment-configured behavior when the scanner finds a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlpMode {
    /// Substitute each match with its pattern's replacement template.
    Mask,
    /// Reject the request outright if any match exists.
    Block,
    /// Return the input unchanged; only record that a match occurred.
    ShadowLog,
}

impl std::str::FromStr for DlpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mask" => Ok(DlpMode::Mask),
            "block" => Ok(DlpMode::Block),
            "shadow_log" => Ok(DlpMode::ShadowLog),
            other => Err(format!("unknown dlp mode '{other}'")),
        }
    }
}

/// A single accepted finding: which pattern matched and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlpMatch {
    pub pattern: String,
    pub start: usize,
    pub end: usize,
}

/// The result of scanning one string.
#[derive(Debug, Clone)]
pub enum DlpOutcome {
    /// No pattern matched; the original string is returned unchanged.
    Clean(String),
    /// Matches were found and the text was redacted (mask mode), or
    /// matches were found and logged without mutation (shadow-log mode).
    Matched {
        text: String,
        matches: Vec<DlpMatch>,
        mutated: bool,
    },
    /// Block mode tripped: the caller must surface an error and must not
    /// forward either the original or redacted text upstream.
    Blocked { matches: Vec<DlpMatch> },
}

impl DlpOutcome {
    pub fn triggered(&self) -> bool {
        !matches!(self, DlpOutcome::Clean(_))
    }

    pub fn match_count(&self) -> usize {
        match self {
            DlpOutcome::Clean(_) => 0,
            DlpOutcome::Matched { matches, .. } => matches.len(),
            DlpOutcome::Blocked { matches } => matches.len(),
        }
    }
}

/// Stateless pattern-matching engine over the static [`patterns::PATTERNS`]
/// catalog. Cheap to construct — holds no per-instance state — but kept as
/// a type so the pipeline can depend on a trait object / swap fakes in
/// tests rather than reaching for a module-level singleton.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlpScanner;

impl DlpScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scan `text` under `mode`. Performance contract: a 4 KB prompt
    /// completes in well under 2ms since every pattern is pre-compiled and
    /// matching is a single linear pass per pattern.
    pub fn scan(&self, text: &str, mode: DlpMode) -> DlpOutcome {
        if text.is_empty() {
            return DlpOutcome::Clean(text.to_string());
        }

        let mut matches = Vec::new();
        let mut redacted = text.to_string();

        for pattern in patterns::PATTERNS.iter() {
            // Collect matches against the ORIGINAL text so offsets stay
            // meaningful even as `redacted` is rewritten pattern-by-pattern.
            for m in pattern.regex.find_iter(text) {
                if !patterns::accepts(pattern.name, &m) {
                    continue;
                }
                matches.push(DlpMatch {
                    pattern: pattern.name.to_string(),
                    start: m.start(),
                    end: m.end(),
                });
            }

            if pattern.name == "credit_card" {
                // Only substitute Luhn-valid candidates; a blanket
                // `regex.replace_all` would also redact non-card digit runs.
                redacted = pattern
                    .regex
                    .replace_all(&redacted, |caps: &regex::Captures| {
                        let whole = caps.get(0).unwrap();
                        if passes_luhn_checked(whole.as_str()) {
                            pattern.replacement.to_string()
                        } else {
                            whole.as_str().to_string()
                        }
                    })
                    .into_owned();
            } else {
                redacted = pattern
                    .regex
                    .replace_all(&redacted, pattern.replacement)
                    .into_owned();
            }
        }

        if matches.is_empty() {
            return DlpOutcome::Clean(text.to_string());
        }

        match mode {
            DlpMode::Block => {
                warn!(count = matches.len(), "dlp blocked request");
                DlpOutcome::Blocked { matches }
            }
            DlpMode::Mask => DlpOutcome::Matched {
                text: redacted,
                matches,
                mutated: true,
            },
            DlpMode::ShadowLog => {
                info!(count = matches.len(), "dlp shadow-log match, not mutating");
                DlpOutcome::Matched {
                    text: text.to_string(),
                    matches,
                    mutated: false,
                }
            }
        }
    }

    /// Shannon entropy of `text`, in bits per character. Advisory only —
    /// never gates a decision, never mutates text.
    pub fn shannon_entropy(text: &str) -> f64 {
        if text.is_empty() {
            return 0.0;
        }
        let mut freq = std::collections::HashMap::new();
        for c in text.chars() {
            *freq.entry(c).or_insert(0u32) += 1;
        }
        let len = text.chars().count() as f64;
        freq.values().fold(0.0, |acc, &count| {
            let p = count as f64 / len;
            acc - p * p.log2()
        })
    }

    /// Heuristic: is `text` likely to be a secret token? High entropy
    /// (>=3.5 bits/char), length >=20, and a mix of >=3 character classes.
    /// Advisory — callers may surface it as a hint, never as a block.
    pub fn is_likely_secret(text: &str) -> bool {
        if text.chars().count() < 20 {
            return false;
        }
        if Self::shannon_entropy(text) < 3.5 {
            return false;
        }
        let has_upper = text.chars().any(|c| c.is_uppercase());
        let has_lower = text.chars().any(|c| c.is_lowercase());
        let has_digit = text.chars().any(|c| c.is_ascii_digit());
        let has_special = text.chars().any(|c| !c.is_alphanumeric());
        let class_count =
            [has_upper, has_lower, has_digit, has_special].iter().filter(|b| **b).count();
        class_count >= 3
    }
}

fn passes_luhn_checked(candidate: &str) -> bool {
    patterns::passes_luhn(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_mode_redacts_openai_key() {
        let scanner = DlpScanner::new();
        let outcome = scanner.scan("my key is sk-abcdefghij1234567890", DlpMode::Mask);
        match outcome {
            DlpOutcome::Matched { text, matches, mutated } => {
                assert!(mutated);
                assert!(!text.contains("sk-abcdefghij1234567890"));
                assert!(text.contains("sk-****"));
                assert_eq!(matches[0].pattern, "openai_key");
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn block_mode_does_not_redact_just_blocks() {
        let scanner = DlpScanner::new();
        let outcome = scanner.scan("sk-abcdefghij1234567890", DlpMode::Block);
        assert!(matches!(outcome, DlpOutcome::Blocked { .. }));
    }

    #[test]
    fn shadow_log_mode_never_mutates() {
        let scanner = DlpScanner::new();
        let input = "contact me at person@example.com";
        let outcome = scanner.scan(input, DlpMode::ShadowLog);
        match outcome {
            DlpOutcome::Matched { text, mutated, .. } => {
                assert!(!mutated);
                assert_eq!(text, input);
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn clean_text_is_unchanged() {
        let scanner = DlpScanner::new();
        let outcome = scanner.scan("nothing sensitive here", DlpMode::Mask);
        assert!(!outcome.triggered());
    }

    #[test]
    fn credit_card_candidate_requires_luhn() {
        let scanner = DlpScanner::new();
        // Digit run shaped like a card but failing Luhn must not be redacted.
        let outcome = scanner.scan("order number 1234 5678 9012 3456", DlpMode::Mask);
        assert!(!outcome.triggered());
    }

    #[test]
    fn credit_card_luhn_valid_is_redacted() {
        let scanner = DlpScanner::new();
        let outcome = scanner.scan("card 4532 0151 1283 0366 on file", DlpMode::Mask);
        match outcome {
            DlpOutcome::Matched { text, .. } => {
                assert!(text.contains("****-****-****-****"));
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn entropy_of_empty_string_is_zero() {
        assert_eq!(DlpScanner::shannon_entropy(""), 0.0);
    }

    #[test]
    fn is_likely_secret_flags_mixed_class_random_string() {
        assert!(DlpScanner::is_likely_secret("aB3$kP9mQ2zR7vT1xL4wN6"));
    }

    #[test]
    fn is_likely_secret_rejects_short_strings() {
        assert!(!DlpScanner::is_likely_secret("aB3$"));
    }

    #[test]
    fn mask_output_never_leaves_pattern_as_substring() {
        let scanner = DlpScanner::new();
        let input = "key=sk-abcdefghij1234567890 and email a@b.com";
        let outcome = scanner.scan(input, DlpMode::Mask);
        if let DlpOutcome::Matched { text, .. } = outcome {
            for pattern in patterns::PATTERNS.iter() {
                for m in pattern.regex.find_iter(&text) {
                    // the only permissible residual match is inside a replacement template itself
                    assert!(pattern.replacement.contains(m.as_str()) || m.as_str() == "****");
                }
            }
        }
    }
}
