//! Two-leg retrieval. Vector and lexical searches run concurrently and
//! their candidate lists are fused into one ranking; a failed leg
//! degrades the turn instead of failing it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use parley_core::config::RetrievalConfig;
use parley_core::retrieval::{adaptive_alpha, fuse, RetrievalResult, SearchHit};
use parley_core::text::content_words;
use parley_db::repositories::{RecordRepository, RepositoryError};

const PROJECTION_DIMS: usize = 64;
const EXCERPT_CHARS: usize = 160;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("search backend unavailable: {0}")]
    Backend(String),
}

impl From<RepositoryError> for SearchError {
    fn from(value: RepositoryError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// One retrieval backend with both legs. `k` is the candidate budget
/// per leg, not the final result count.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError>;
    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// Outcome of one retrieval pass.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalOutcome {
    pub results: Vec<RetrievalResult>,
    /// Set when at least one leg failed and the ranking is partial.
    pub degraded: bool,
}

pub struct RetrievalFusionEngine<I> {
    index: I,
    top_k: usize,
    candidate_multiplier: usize,
    fixed_alpha: Option<f64>,
}

impl<I> RetrievalFusionEngine<I>
where
    I: SearchIndex,
{
    pub fn new(index: I, config: &RetrievalConfig) -> Self {
        Self {
            index,
            top_k: config.top_k as usize,
            candidate_multiplier: config.candidate_multiplier as usize,
            fixed_alpha: config.fixed_alpha,
        }
    }

    /// Runs both legs concurrently and fuses whatever came back. Alpha
    /// precedence: per-variant override, then the configured pin, then
    /// the adaptive heuristic.
    pub async fn retrieve(&self, query: &str, alpha_override: Option<f64>) -> RetrievalOutcome {
        let candidates = self.top_k * self.candidate_multiplier;
        let (vector, lexical) = tokio::join!(
            self.index.vector_search(query, candidates),
            self.index.lexical_search(query, candidates),
        );

        let alpha = alpha_override.or(self.fixed_alpha).unwrap_or_else(|| adaptive_alpha(query));

        let (vector_hits, lexical_hits, degraded) = match (vector, lexical) {
            (Ok(vector), Ok(lexical)) => (vector, lexical, false),
            (Ok(vector), Err(error)) => {
                warn!(
                    event_name = "agent.retrieval.degraded",
                    leg = "lexical",
                    error = %error,
                    "lexical search failed; fusing vector hits alone"
                );
                (vector, Vec::new(), true)
            }
            (Err(error), Ok(lexical)) => {
                warn!(
                    event_name = "agent.retrieval.degraded",
                    leg = "vector",
                    error = %error,
                    "vector search failed; fusing lexical hits alone"
                );
                (Vec::new(), lexical, true)
            }
            (Err(vector_error), Err(lexical_error)) => {
                warn!(
                    event_name = "agent.retrieval.degraded",
                    leg = "both",
                    vector_error = %vector_error,
                    lexical_error = %lexical_error,
                    "both search legs failed; answering without context"
                );
                (Vec::new(), Vec::new(), true)
            }
        };

        RetrievalOutcome {
            results: fuse(&vector_hits, &lexical_hits, alpha, self.top_k),
            degraded,
        }
    }
}

/// Search over the record corpus itself. The lexical leg scores
/// content-word overlap; the vector leg projects token counts onto a
/// fixed number of dimensions and scores cosine similarity. Both are
/// pure functions of the stored text, so rankings are reproducible.
#[derive(Clone, Debug)]
pub struct CorpusSearchIndex<R> {
    records: R,
}

impl<R> CorpusSearchIndex<R>
where
    R: RecordRepository,
{
    pub fn new(records: R) -> Self {
        Self { records }
    }

    async fn documents(&self) -> Result<Vec<(String, String)>, SearchError> {
        let records = self.records.list(None).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let text = format!("{} {}", record.title, record.body);
                (record.id.0, text)
            })
            .collect())
    }
}

#[async_trait]
impl<R> SearchIndex for CorpusSearchIndex<R>
where
    R: RecordRepository,
{
    async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let query_vector = project(query);
        let mut hits: Vec<SearchHit> = self
            .documents()
            .await?
            .into_iter()
            .filter_map(|(source_id, text)| {
                let score = cosine(&query_vector, &project(&text));
                (score > 0.0).then(|| SearchHit {
                    source_id,
                    excerpt: excerpt_of(&text),
                    score,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let query_words = content_words(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .documents()
            .await?
            .into_iter()
            .filter_map(|(source_id, text)| {
                let document_words: BTreeSet<String> = content_words(&text).into_iter().collect();
                let matched =
                    query_words.iter().filter(|word| document_words.contains(*word)).count();
                (matched > 0).then(|| SearchHit {
                    source_id,
                    excerpt: excerpt_of(&text),
                    score: matched as f64 / query_words.len() as f64,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

/// Fixed result sets for tests and the smoke scenarios; either leg can
/// be scripted to fail.
#[derive(Clone, Debug)]
pub struct StaticSearchIndex {
    vector: Result<Vec<SearchHit>, SearchError>,
    lexical: Result<Vec<SearchHit>, SearchError>,
}

impl StaticSearchIndex {
    pub fn new(vector: Vec<SearchHit>, lexical: Vec<SearchHit>) -> Self {
        Self { vector: Ok(vector), lexical: Ok(lexical) }
    }

    pub fn with_outcomes(
        vector: Result<Vec<SearchHit>, SearchError>,
        lexical: Result<Vec<SearchHit>, SearchError>,
    ) -> Self {
        Self { vector, lexical }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl SearchIndex for StaticSearchIndex {
    async fn vector_search(&self, _query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.vector.clone().map(|hits| truncated(hits, k))
    }

    async fn lexical_search(&self, _query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.lexical.clone().map(|hits| truncated(hits, k))
    }
}

fn truncated(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.truncate(k);
    hits
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score.total_cmp(&a.score).then_with(|| a.source_id.cmp(&b.source_id))
    });
}

fn project(text: &str) -> [f64; PROJECTION_DIMS] {
    let mut vector = [0.0; PROJECTION_DIMS];
    for token in content_words(text) {
        let dimension = token.bytes().map(u64::from).sum::<u64>() as usize % PROJECTION_DIMS;
        vector[dimension] += 1.0;
    }
    vector
}

fn cosine(a: &[f64; PROJECTION_DIMS], b: &[f64; PROJECTION_DIMS]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn excerpt_of(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    text.chars().take(EXCERPT_CHARS).collect()
}
