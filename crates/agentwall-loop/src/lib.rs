//! Loop/oscillation detection (component C3).
//!
//! Classifies a prompt/response pair against a short ring of recent
//! prompts and responses from the same run. Pure, in-memory, non-suspending
//! — callers invoke it twice per request (pre-check with an empty response,
//! post-check with the upstream reply).

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Which decision rule fired. Serializes to the strings used in
/// `error.loop_type` / `RequestLogEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    ExactPrompt,
    ExactResponse,
    SimilarPrompt,
    Oscillation,
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopType::ExactPrompt => "exact_prompt",
            LoopType::ExactResponse => "exact_response",
            LoopType::SimilarPrompt => "similar_prompt",
            LoopType::Oscillation => "oscillation",
        };
        write!(f, "{s}")
    }
}

/// Result of one loop-detection check.
#[derive(Debug, Clone)]
pub struct LoopCheck {
    pub is_loop: bool,
    pub confidence: f64,
    pub loop_type: Option<LoopType>,
    pub message: String,
}

impl LoopCheck {
    fn clean() -> Self {
        Self {
            is_loop: false,
            confidence: 0.0,
            loop_type: None,
            message: String::new(),
        }
    }

    /// Whether this result is confident enough to reject the step outright
    /// (the pre-check blocks at confidence >= 0.95).
    pub fn blocks(&self, threshold: f64) -> bool {
        self.is_loop && self.confidence >= threshold
    }
}

/// Jaccard similarity threshold floor used when the detector is asked
/// without an explicit threshold override.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.95;
/// Oscillation and exact matches always report this confidence regardless
/// of the configured Jaccard threshold.
const OSCILLATION_CONFIDENCE: f64 = 0.9;
const EXACT_CONFIDENCE: f64 = 1.0;

/// Stateless loop classifier. Holds no data of its own — all history lives
/// in the caller's `Run` record — so it is cheap to construct per request
/// or share behind an `Arc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopDetector;

impl LoopDetector {
    pub fn new() -> Self {
        Self
    }

    /// Run the full decision cascade. `current_response` is empty on the
    /// pre-check (no upstream reply exists yet); exact/similar-response
    /// rules are skipped in that case since there is nothing to compare.
    ///
    /// Decision precedence, first match wins:
    /// 1. exact prompt match against any ring entry
    /// 2. exact response match against any ring entry (skipped if response is empty)
    /// 3. Jaccard similarity >= `threshold` against the last 3 ring entries
    /// 4. oscillation A-B-A-B over the last 4 prompts including the current one
    pub fn check(
        &self,
        current_prompt: &str,
        current_response: &str,
        recent_prompts: &[String],
        recent_responses: &[String],
        threshold: f64,
    ) -> LoopCheck {
        if recent_prompts.is_empty() {
            return LoopCheck::clean();
        }

        let current_hash = normalized_hash(current_prompt);
        for (i, prev) in recent_prompts.iter().enumerate() {
            if normalized_hash(prev) == current_hash {
                return LoopCheck {
                    is_loop: true,
                    confidence: EXACT_CONFIDENCE,
                    loop_type: Some(LoopType::ExactPrompt),
                    message: format!(
                        "exact prompt repetition (matches step -{})",
                        recent_prompts.len() - i
                    ),
                };
            }
        }

        if !current_response.is_empty() && !recent_responses.is_empty() {
            let response_hash = normalized_hash(current_response);
            for prev in recent_responses {
                if normalized_hash(prev) == response_hash {
                    return LoopCheck {
                        is_loop: true,
                        confidence: EXACT_CONFIDENCE,
                        loop_type: Some(LoopType::ExactResponse),
                        message: "exact response repetition".into(),
                    };
                }
            }
        }

        let tail_start = recent_prompts.len().saturating_sub(3);
        for prev in &recent_prompts[tail_start..] {
            let similarity = jaccard_similarity(current_prompt, prev);
            if similarity >= threshold {
                return LoopCheck {
                    is_loop: true,
                    confidence: similarity,
                    loop_type: Some(LoopType::SimilarPrompt),
                    message: format!("similar prompt detected ({:.1}% similarity)", similarity * 100.0),
                };
            }
        }

        if recent_prompts.len() >= 3 {
            let mut window: Vec<&str> = recent_prompts.iter().map(String::as_str).collect();
            window.push(current_prompt);
            if detect_oscillation(&window) {
                return LoopCheck {
                    is_loop: true,
                    confidence: OSCILLATION_CONFIDENCE,
                    loop_type: Some(LoopType::Oscillation),
                    message: "oscillation pattern detected (A-B-A-B)".into(),
                };
            }
        }

        LoopCheck::clean()
    }
}

/// MD5 of the lower-cased, trimmed text — normalizes away whitespace and
/// case differences that shouldn't defeat exact-match detection.
fn normalized_hash(text: &str) -> [u8; 16] {
    let normalized = text.to_lowercase();
    let normalized = normalized.trim();
    let mut hasher = Md5::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

/// Jaccard similarity over whitespace-tokenized, lower-cased word sets.
/// Symmetric and in [0, 1] by construction; 0.0 if either side tokenizes
/// to nothing.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let words_a: std::collections::HashSet<&str> = lower_a.split_whitespace().collect();
    let words_b: std::collections::HashSet<&str> = lower_b.split_whitespace().collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

/// Detects an A-B-A-B pattern over the last four entries of `prompts`
/// (positions -4,-3,-2,-1): position -4 == -2, -3 == -1, and -4 != -3.
///
/// Note: for a literal two-value alternation this clause is only ever
/// reached when rule 1 (exact-prompt, checked against the *whole* ring)
/// does not already match — which for a strict A,B,A,B,... sequence it
/// always will, since the repeating value is already present verbatim
/// in the ring by the time it recurs. The clause still exists for the
/// case where the ring has since evicted the earlier occurrence (ring
/// capacity 5) while a 4-window oscillation remains visible.
pub fn detect_oscillation(prompts: &[&str]) -> bool {
    if prompts.len() < 4 {
        return false;
    }
    let last4 = &prompts[prompts.len() - 4..];
    let hashes: Vec<[u8; 16]> = last4.iter().map(|p| normalized_hash(p)).collect();
    hashes[0] == hashes[2] && hashes[1] == hashes[3] && hashes[0] != hashes[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_ring_is_never_a_loop() {
        let detector = LoopDetector::new();
        let result = detector.check("hello", "", &[], &[], 0.95);
        assert!(!result.is_loop);
    }

    #[test]
    fn exact_duplicate_prompt_is_confidence_one() {
        let detector = LoopDetector::new();
        let ring = strings(&["What is 2+2?"]);
        let result = detector.check("What is 2+2?", "", &ring, &[], 0.95);
        assert!(result.is_loop);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.loop_type, Some(LoopType::ExactPrompt));
    }

    #[test]
    fn exact_duplicate_is_case_and_whitespace_insensitive() {
        let detector = LoopDetector::new();
        let ring = strings(&["  What Is 2+2?  "]);
        let result = detector.check("what is 2+2?", "", &ring, &[], 0.95);
        assert!(result.is_loop);
    }

    #[test]
    fn exact_response_match_detected_only_on_post_check() {
        let detector = LoopDetector::new();
        let prompts = strings(&["step one", "step two"]);
        let responses = strings(&["same answer", "different"]);
        // pre-check: empty response, must not trigger exact-response
        let pre = detector.check("step three", "", &prompts, &responses, 0.95);
        assert!(!pre.is_loop);
        let post = detector.check("step three", "same answer", &prompts, &responses, 0.95);
        assert_eq!(post.loop_type, Some(LoopType::ExactResponse));
    }

    #[test]
    fn similar_prompt_uses_jaccard_against_last_three() {
        let detector = LoopDetector::new();
        let ring = strings(&["please summarize this document for me"]);
        let result = detector.check(
            "please summarize this document for me now",
            "",
            &ring,
            &[],
            0.5,
        );
        assert_eq!(result.loop_type, Some(LoopType::SimilarPrompt));
    }

    #[test]
    fn oscillation_helper_detects_a_b_a_b() {
        assert!(detect_oscillation(&["plan A", "plan B", "plan A", "plan B"]));
    }

    #[test]
    fn oscillation_helper_rejects_non_alternating() {
        assert!(!detect_oscillation(&["plan A", "plan B", "plan C", "plan D"]));
        assert!(!detect_oscillation(&["plan A", "plan A", "plan A", "plan A"]));
    }

    #[test]
    fn exact_prompt_precedes_oscillation_for_literal_alternation() {
        // A strict A,B,A,B,... sequence is always caught by the exact-prompt
        // rule (checked against the whole ring) before the 4-window
        // oscillation rule gets a chance to fire — see the note on
        // `detect_oscillation`.
        let detector = LoopDetector::new();
        let ring = strings(&["plan A", "plan B", "plan A"]);
        let result = detector.check("plan B", "", &ring, &[], 0.99);
        assert_eq!(result.loop_type, Some(LoopType::ExactPrompt));
    }

    #[test]
    fn unrelated_prompts_are_not_a_loop() {
        let detector = LoopDetector::new();
        let ring = strings(&["what's the weather", "tell me a joke"]);
        let result = detector.check("write a poem about the sea", "", &ring, &[], 0.95);
        assert!(!result.is_loop);
    }

    #[test]
    fn jaccard_is_symmetric_and_bounded() {
        let a = "the quick brown fox";
        let b = "the slow brown dog";
        let s1 = jaccard_similarity(a, b);
        let s2 = jaccard_similarity(b, a);
        assert_eq!(s1, s2);
        assert!((0.0..=1.0).contains(&s1));
    }

    #[test]
    fn jaccard_identical_strings_is_one() {
        assert_eq!(jaccard_similarity("same text here", "same text here"), 1.0);
    }

    #[test]
    fn jaccard_is_case_insensitive() {
        assert_eq!(jaccard_similarity("Same Text Here", "same text here"), 1.0);
    }

    #[test]
    fn blocks_respects_threshold() {
        let check = LoopCheck {
            is_loop: true,
            confidence: 0.8,
            loop_type: Some(LoopType::SimilarPrompt),
            message: String::new(),
        };
        assert!(!check.blocks(0.95));
        assert!(check.blocks(0.5));
    }
}
