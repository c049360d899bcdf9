use serde::{Deserialize, Serialize};

use crate::retrieval::RetrievalResult;
use crate::text::{content_words, sentences};

/// Style rules a draft answer must satisfy before it ships.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StylePolicy {
    pub banned_phrases: Vec<String>,
    pub max_answer_chars: usize,
    /// Fraction of a claim's content words that must appear in at
    /// least one retrieved excerpt for the claim to count as grounded.
    pub min_claim_support: f64,
}

impl Default for StylePolicy {
    fn default() -> Self {
        Self {
            banned_phrases: vec![
                "as an ai".to_string(),
                "needless to say".to_string(),
                "to be honest".to_string(),
            ],
            max_answer_chars: 1_200,
            min_claim_support: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UnsupportedClaim,
    Tone,
    Formatting,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedClaim => "unsupported_claim",
            Self::Tone => "tone",
            Self::Formatting => "formatting",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionOutcome {
    Pass,
    Refine,
    Rewrite,
}

impl ReflectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Refine => "refine",
            Self::Rewrite => "rewrite",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionVerdict {
    pub outcome: ReflectionOutcome,
    pub violations: Vec<Violation>,
}

/// Checks a draft against the retrieved context and the style policy.
///
/// Unsupported claims ask for a refinement pass that drops or fixes
/// them; when every specific claim misses the context the draft is
/// treated as unsalvageable and a rewrite is demanded instead. The
/// checks are deterministic text heuristics, so a given draft always
/// earns the same verdict.
#[derive(Clone, Debug, Default)]
pub struct ReflectionValidator {
    policy: StylePolicy,
}

impl ReflectionValidator {
    pub fn new(policy: StylePolicy) -> Self {
        Self { policy }
    }

    pub fn evaluate(&self, draft: &str, context: &[RetrievalResult]) -> ReflectionVerdict {
        let mut violations = Vec::new();

        // With nothing retrieved there is nothing to ground against;
        // claim checking is skipped and the draft is expected to
        // present itself as unsourced.
        let mut checked_claims = 0;
        if !context.is_empty() {
            checked_claims = self.check_claims(draft, context, &mut violations);
        }
        self.check_tone(draft, &mut violations);
        self.check_formatting(draft, &mut violations);

        let unsupported =
            violations.iter().filter(|v| v.kind == ViolationKind::UnsupportedClaim).count();
        let outcome = if checked_claims > 0 && unsupported == checked_claims {
            ReflectionOutcome::Rewrite
        } else if violations.is_empty() {
            ReflectionOutcome::Pass
        } else {
            ReflectionOutcome::Refine
        };

        ReflectionVerdict { outcome, violations }
    }

    /// Returns how many claims were specific enough to check.
    fn check_claims(
        &self,
        draft: &str,
        context: &[RetrievalResult],
        violations: &mut Vec<Violation>,
    ) -> usize {
        let excerpt_words: Vec<Vec<String>> =
            context.iter().map(|result| content_words(&result.excerpt)).collect();

        let mut checked = 0;
        for sentence in sentences(draft) {
            if !asserts_specifics(&sentence) {
                continue;
            }
            let words = content_words(&sentence);
            if words.len() < 3 {
                continue;
            }

            checked += 1;
            let support = excerpt_words
                .iter()
                .map(|excerpt| overlap_ratio(&words, excerpt))
                .fold(0.0_f64, f64::max);
            if support < self.policy.min_claim_support {
                violations.push(Violation {
                    kind: ViolationKind::UnsupportedClaim,
                    detail: format!("claim lacks support in retrieved context: {sentence}"),
                });
            }
        }
        checked
    }

    fn check_tone(&self, draft: &str, violations: &mut Vec<Violation>) {
        let lowered = draft.to_lowercase();
        for phrase in &self.policy.banned_phrases {
            if lowered.contains(&phrase.to_lowercase()) {
                violations.push(Violation {
                    kind: ViolationKind::Tone,
                    detail: format!("banned phrase present: {phrase}"),
                });
            }
        }
    }

    fn check_formatting(&self, draft: &str, violations: &mut Vec<Violation>) {
        if draft.chars().count() > self.policy.max_answer_chars {
            violations.push(Violation {
                kind: ViolationKind::Formatting,
                detail: format!(
                    "answer exceeds {} characters",
                    self.policy.max_answer_chars
                ),
            });
        }
        if draft.contains("http://") || draft.contains("https://") {
            violations.push(Violation {
                kind: ViolationKind::Formatting,
                detail: "raw URLs are not allowed in answers".to_string(),
            });
        }
    }
}

/// A sentence asserts specifics when it carries a number or a
/// mid-sentence capitalized name. Hedged prose without either is left
/// alone.
fn asserts_specifics(sentence: &str) -> bool {
    if sentence.chars().any(|ch| ch.is_ascii_digit()) {
        return true;
    }
    sentence.split_whitespace().skip(1).any(|word| {
        word.chars().next().is_some_and(|ch| ch.is_uppercase()) && word.chars().count() >= 2
    })
}

fn overlap_ratio(claim_words: &[String], excerpt_words: &[String]) -> f64 {
    if claim_words.is_empty() {
        return 0.0;
    }
    let matched =
        claim_words.iter().filter(|word| excerpt_words.contains(word)).count();
    matched as f64 / claim_words.len() as f64
}
