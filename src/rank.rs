use chrono::{DateTime, Utc};

/// Weight of the cosine-similarity component relative to lexical BM25.
const VECTOR_WEIGHT: f64 = 2.0;

/// Freshness half-life in days for the recency component.
const RECENCY_SCALE_DAYS: f64 = 7.0;

#[derive(Debug, Clone)]
pub struct ScoredItem<T> {
    pub item: T,
    pub lexical: f64,
    pub vector: Option<f64>,
    pub score: f64,
}

/// Bounded (0, 1] freshness term; 1.0 for items created now, falling off
/// over `RECENCY_SCALE_DAYS`.
pub fn recency_weight(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    1.0 / (1.0 + age_days / RECENCY_SCALE_DAYS)
}

/// Additive fusion: lexical relevance, a temporal-hint-scaled recency
/// term, and an optional vector similarity.
pub fn fuse_score(
    lexical: f64,
    boost_recency: f64,
    created_at: DateTime<Utc>,
    vector: Option<f64>,
    now: DateTime<Utc>,
) -> f64 {
    lexical + boost_recency * recency_weight(created_at, now) + VECTOR_WEIGHT * vector.unwrap_or(0.0)
}

/// Score and order candidates. Input order is the lexical rank; the sort
/// is stable, so equal combined scores keep the earlier-ranked item first.
pub fn rank_items<T>(
    candidates: Vec<(T, f64, DateTime<Utc>, Option<f64>)>,
    boost_recency: f64,
    now: DateTime<Utc>,
) -> Vec<ScoredItem<T>> {
    let mut scored: Vec<ScoredItem<T>> = candidates
        .into_iter()
        .map(|(item, lexical, created_at, vector)| ScoredItem {
            score: fuse_score(lexical, boost_recency, created_at, vector, now),
            item,
            lexical,
            vector,
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}
