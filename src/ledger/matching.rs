//! Lexical matching of free-text rollback requests against action summaries.

/// Scores how well `query` describes `candidate_summary`. Higher is better.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, candidate_summary: &str, query: &str) -> f64;
}

/// Word-overlap similarity.
///
/// Counts query words longer than two characters that contain, or are
/// contained in, some summary word (both lowercased), divided by the larger
/// of the two word counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordOverlapScorer;

impl SimilarityScorer for WordOverlapScorer {
    fn score(&self, candidate_summary: &str, query: &str) -> f64 {
        let query = query.to_lowercase();
        let summary = candidate_summary.to_lowercase();
        let query_words: Vec<&str> = query.split_whitespace().collect();
        let summary_words: Vec<&str> = summary.split_whitespace().collect();

        let denominator = query_words.len().max(summary_words.len());
        if denominator == 0 {
            return 0.0;
        }

        let matched = query_words
            .iter()
            .filter(|word| word.chars().count() > 2)
            .filter(|word| {
                summary_words
                    .iter()
                    .any(|sw| sw.contains(*word) || word.contains(sw))
            })
            .count();

        matched as f64 / denominator as f64
    }
}

/// Index of the best candidate scoring strictly above `threshold`.
/// Ties keep the earliest index, so newest-first input favors recency.
pub fn best_match<S: AsRef<str>>(
    scorer: &dyn SimilarityScorer,
    candidates: &[S],
    query: &str,
    threshold: f64,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let score = scorer.score(candidate.as_ref(), query);
        let best_score = best.map(|(_, s)| s).unwrap_or(0.0);
        if score > best_score && score > threshold {
            best = Some((idx, score));
        }
    }
    best
}
