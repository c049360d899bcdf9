use serde::{Deserialize, Serialize};

use crate::text::content_words;

/// A raw hit from one search backend, before fusion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_id: String,
    pub excerpt: String,
    pub score: f64,
}

/// A fused hit. Scores from the contributing backends are kept so the
/// blend stays inspectable after the fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub source_id: String,
    pub excerpt: String,
    pub vector_score: f64,
    pub lexical_score: f64,
    pub fused_score: f64,
}

/// Weight of the vector signal in the fused score. Chosen per query
/// unless pinned by config or an experiment variant.
pub fn adaptive_alpha(query: &str) -> f64 {
    let words = content_words(query).len();
    if words <= 3 {
        0.35
    } else if words >= 12 {
        0.75
    } else {
        0.6
    }
}

/// Blends two candidate lists into a single ranking.
///
/// Each list is min-max normalized on its own, so neither backend's
/// score scale dominates. A source present in only one list
/// contributes zero for the missing signal. The output order is a
/// total order (fused desc, vector desc, source id asc) so equal
/// inputs always rank identically.
pub fn fuse(
    vector_hits: &[SearchHit],
    lexical_hits: &[SearchHit],
    alpha: f64,
    top_k: usize,
) -> Vec<RetrievalResult> {
    let vector_norms = normalize_scores(vector_hits);
    let lexical_norms = normalize_scores(lexical_hits);

    let mut fused: Vec<RetrievalResult> = Vec::with_capacity(vector_hits.len() + lexical_hits.len());
    for (hit, norm) in vector_hits.iter().zip(vector_norms.iter()) {
        fused.push(RetrievalResult {
            source_id: hit.source_id.clone(),
            excerpt: hit.excerpt.clone(),
            vector_score: *norm,
            lexical_score: 0.0,
            fused_score: 0.0,
        });
    }
    for (hit, norm) in lexical_hits.iter().zip(lexical_norms.iter()) {
        match fused.iter_mut().find(|entry| entry.source_id == hit.source_id) {
            Some(entry) => entry.lexical_score = *norm,
            None => fused.push(RetrievalResult {
                source_id: hit.source_id.clone(),
                excerpt: hit.excerpt.clone(),
                vector_score: 0.0,
                lexical_score: *norm,
                fused_score: 0.0,
            }),
        }
    }

    for entry in &mut fused {
        entry.fused_score = alpha * entry.vector_score + (1.0 - alpha) * entry.lexical_score;
    }

    fused.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| b.vector_score.total_cmp(&a.vector_score))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    fused.truncate(top_k);
    fused
}

/// Min-max over one backend's scores. Empty and constant lists map to
/// all zeros rather than dividing by a zero range.
fn normalize_scores(hits: &[SearchHit]) -> Vec<f64> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for hit in hits {
        min = min.min(hit.score);
        max = max.max(hit.score);
    }

    let range = max - min;
    if hits.is_empty() || range <= f64::EPSILON {
        return vec![0.0; hits.len()];
    }

    hits.iter().map(|hit| (hit.score - min) / range).collect()
}

#[cfg(test)]
mod tests {
    use super::{adaptive_alpha, fuse, SearchHit};

    fn hit(source_id: &str, score: f64) -> SearchHit {
        SearchHit {
            source_id: source_id.to_string(),
            excerpt: format!("excerpt for {source_id}"),
            score,
        }
    }

    #[test]
    fn alpha_adapts_to_query_length() {
        assert_eq!(adaptive_alpha("refund policy"), 0.35);
        assert_eq!(adaptive_alpha("how does the refund policy apply to annual contracts"), 0.6);
        assert_eq!(
            adaptive_alpha(
                "customer asked whether partial refunds apply when downgrading an annual \
                 enterprise contract mid cycle after already using support credits",
            ),
            0.75
        );
    }

    #[test]
    fn fusion_blends_both_signals_with_alpha() {
        let vector = vec![hit("a", 0.9), hit("b", 0.1)];
        let lexical = vec![hit("b", 5.0), hit("a", 1.0)];

        let results = fuse(&vector, &lexical, 0.6, 10);

        // a: vector 1.0, lexical 0.0 -> 0.6; b: vector 0.0, lexical 1.0 -> 0.4
        assert_eq!(results[0].source_id, "a");
        assert!((results[0].fused_score - 0.6).abs() < 1e-9);
        assert_eq!(results[1].source_id, "b");
        assert!((results[1].fused_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn source_in_one_list_contributes_zero_for_the_missing_signal() {
        let vector = vec![hit("only-vector", 0.8), hit("shared", 0.2)];
        let lexical = vec![hit("shared", 3.0), hit("only-lexical", 1.0)];

        let results = fuse(&vector, &lexical, 0.5, 10);

        let only_vector = results.iter().find(|r| r.source_id == "only-vector").expect("present");
        assert_eq!(only_vector.lexical_score, 0.0);
        let only_lexical = results.iter().find(|r| r.source_id == "only-lexical").expect("present");
        assert_eq!(only_lexical.vector_score, 0.0);
    }

    #[test]
    fn constant_score_list_normalizes_to_zeros() {
        let vector = vec![hit("a", 0.5), hit("b", 0.5), hit("c", 0.5)];
        let lexical = vec![hit("b", 2.0), hit("c", 1.0)];

        let results = fuse(&vector, &lexical, 0.5, 10);

        for result in &results {
            assert_eq!(result.vector_score, 0.0, "constant vector list must normalize to zero");
        }
        let best = &results[0];
        assert_eq!(best.source_id, "b");
        assert!((best.fused_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_lists_fuse_to_nothing() {
        assert!(fuse(&[], &[], 0.6, 5).is_empty());
    }

    #[test]
    fn ties_order_by_vector_score_then_source_id() {
        // Both sources fuse to the same score with alpha 0.5.
        let vector = vec![hit("zed", 1.0), hit("base", 0.0)];
        let lexical = vec![hit("base", 1.0), hit("zed", 0.0)];

        let results = fuse(&vector, &lexical, 0.5, 10);

        assert_eq!(results.len(), 2);
        assert!((results[0].fused_score - results[1].fused_score).abs() < 1e-9);
        // zed carries the vector signal, so it wins the tie despite the
        // later alphabetical id.
        assert_eq!(results[0].source_id, "zed");
        assert_eq!(results[1].source_id, "base");
    }

    #[test]
    fn equal_fused_and_vector_scores_fall_back_to_source_id() {
        let vector = vec![hit("beta", 1.0), hit("alpha", 1.0)];
        let lexical: Vec<SearchHit> = Vec::new();

        let results = fuse(&vector, &lexical, 0.6, 10);

        // Constant vector list normalizes to zeros, so everything ties;
        // ids break the tie ascending.
        assert_eq!(results[0].source_id, "alpha");
        assert_eq!(results[1].source_id, "beta");
    }

    #[test]
    fn alpha_one_ranks_purely_by_vector_signal() {
        let vector = vec![hit("a", 0.9), hit("b", 0.6), hit("c", 0.3)];
        let lexical = vec![hit("c", 9.0), hit("b", 5.0), hit("a", 1.0)];

        let results = fuse(&vector, &lexical, 1.0, 10);

        let order: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn alpha_zero_ranks_purely_by_lexical_signal() {
        let vector = vec![hit("a", 0.9), hit("b", 0.6), hit("c", 0.3)];
        let lexical = vec![hit("c", 9.0), hit("b", 5.0), hit("a", 1.0)];

        let results = fuse(&vector, &lexical, 0.0, 10);

        let order: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn top_k_truncates_after_ordering() {
        let vector = vec![hit("a", 0.9), hit("b", 0.5), hit("c", 0.1)];
        let lexical = vec![hit("a", 2.0), hit("b", 1.0), hit("c", 0.5)];

        let results = fuse(&vector, &lexical, 0.6, 2);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_id, "a");
    }

    #[test]
    fn fusion_is_deterministic_for_equal_inputs() {
        let vector = vec![hit("a", 0.7), hit("b", 0.7), hit("c", 0.2)];
        let lexical = vec![hit("c", 1.5), hit("b", 1.5), hit("a", 0.3)];

        let first = fuse(&vector, &lexical, 0.4, 3);
        let second = fuse(&vector, &lexical, 0.4, 3);

        assert_eq!(first, second);
    }
}
