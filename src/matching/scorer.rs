//! String similarity metrics
//!
//! All scores are in `0.0..=1.0`. Empty (or whitespace-only) text scores 0
//! against anything, itself included, so an image with no text is never
//! matched.

use strsim::normalized_levenshtein;

use super::ScorerKind;

/// A normalized similarity metric between two recognized texts
pub trait SimilarityScorer: Send + Sync {
    /// Short name for logs and reports
    fn name(&self) -> &'static str;

    /// Similarity of two non-empty strings
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Similarity with the empty-text rule applied
    fn score(&self, a: &str, b: &str) -> f64 {
        if a.trim().is_empty() || b.trim().is_empty() {
            return 0.0;
        }
        self.similarity(a, b).clamp(0.0, 1.0)
    }
}

/// `1 - levenshtein / max_len`, character based
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinScorer;

impl SimilarityScorer for LevenshteinScorer {
    fn name(&self) -> &'static str {
        "levenshtein"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        normalized_levenshtein(a, b)
    }
}

/// Indel ratio: `2 * LCS / (len_a + len_b)`, character based
#[derive(Debug, Clone, Copy, Default)]
pub struct RatioScorer;

impl SimilarityScorer for RatioScorer {
    fn name(&self) -> &'static str {
        "ratio"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let total = a.len() + b.len();
        if total == 0 {
            return 1.0;
        }
        2.0 * lcs_len(&a, &b) as f64 / total as f64
    }
}

/// Longest common subsequence length, two-row DP
fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Scores lowercased text, and again with everything but letters and digits
/// removed, keeping the better result
///
/// OCR often drops or invents punctuation ("4.5M" vs "45M").
pub struct NormalizingScorer {
    inner: Box<dyn SimilarityScorer>,
}

impl NormalizingScorer {
    pub fn new(inner: Box<dyn SimilarityScorer>) -> Self {
        Self { inner }
    }
}

impl SimilarityScorer for NormalizingScorer {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a_lower = a.to_lowercase();
        let b_lower = b.to_lowercase();
        let base = self.inner.score(&a_lower, &b_lower);

        let a_alnum: String = a_lower.chars().filter(|c| c.is_alphanumeric()).collect();
        let b_alnum: String = b_lower.chars().filter(|c| c.is_alphanumeric()).collect();
        let stripped = self.inner.score(&a_alnum, &b_alnum);

        base.max(stripped)
    }
}

/// Scorer for the configured metric
pub fn build_scorer(kind: ScorerKind, normalize: bool) -> Box<dyn SimilarityScorer> {
    let base: Box<dyn SimilarityScorer> = match kind {
        ScorerKind::Levenshtein => Box::new(LevenshteinScorer),
        ScorerKind::Ratio => Box::new(RatioScorer),
    };
    if normalize {
        Box::new(NormalizingScorer::new(base))
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_scorers() -> Vec<Box<dyn SimilarityScorer>> {
        vec![
            build_scorer(ScorerKind::Levenshtein, false),
            build_scorer(ScorerKind::Ratio, false),
            build_scorer(ScorerKind::Levenshtein, true),
            build_scorer(ScorerKind::Ratio, true),
        ]
    }

    #[test]
    fn test_self_similarity_is_one() {
        for scorer in all_scorers() {
            for text in ["Chapter One", "第一章", "a", "  x y  "] {
                assert_eq!(scorer.score(text, text), 1.0, "{} on {:?}", scorer.name(), text);
            }
        }
    }

    #[test]
    fn test_empty_text_scores_zero() {
        for scorer in all_scorers() {
            assert_eq!(scorer.score("", "anything"), 0.0);
            assert_eq!(scorer.score("anything", ""), 0.0);
            assert_eq!(scorer.score("", ""), 0.0);
            assert_eq!(scorer.score("   ", "\n"), 0.0);
        }
    }

    #[test]
    fn test_levenshtein_single_typo() {
        let score = LevenshteinScorer.score("Chapter One", "Chaptr One");
        assert!((score - 10.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_single_typo() {
        let score = RatioScorer.score("Chapter One", "Chaptr One");
        assert!((score - 20.0 / 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_is_order_sensitive() {
        let score = RatioScorer.score("one two", "two one");
        assert!(score < 1.0);
        assert!(score > 0.0);
    }

    #[test]
    fn test_lcs() {
        let a: Vec<char> = "ABCBDAB".chars().collect();
        let b: Vec<char> = "BDCABA".chars().collect();
        assert_eq!(lcs_len(&a, &b), 4);
        assert_eq!(lcs_len(&[], &b), 0);
    }

    #[test]
    fn test_normalizing_ignores_case_and_punctuation() {
        let plain = LevenshteinScorer;
        let normalizing = NormalizingScorer::new(Box::new(LevenshteinScorer));

        assert!(plain.score("4.5M Gold", "45m gold") < 0.9);
        assert_eq!(normalizing.score("4.5M Gold", "45m gold"), 1.0);
        assert_eq!(normalizing.score("HELLO", "hello"), 1.0);
    }

    #[test]
    fn test_normalizing_punctuation_only_text() {
        let normalizing = NormalizingScorer::new(Box::new(RatioScorer));
        // Stripped forms are empty; the lowercase comparison still applies
        assert_eq!(normalizing.score("...", "..."), 1.0);
        assert_eq!(normalizing.score("...", "abc"), 0.0);
    }
}
