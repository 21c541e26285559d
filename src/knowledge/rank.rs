//! Result ranking and hybrid fusion
//!
//! Lexical (bm25) and vector (cosine) scores live on different scales, so each
//! list is min-max normalized to [0, 1] before the weighted sum. Ties break by
//! popularity descending, then key ascending.

use crate::error::{Error, Result};
use crate::models::{ResourceKey, ResourceRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How a query is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Semantic,
    #[default]
    Hybrid,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Lexical => write!(f, "lexical"),
            SearchMode::Semantic => write!(f, "semantic"),
            SearchMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lexical" | "keyword" => Ok(SearchMode::Lexical),
            "semantic" | "vector" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => Err(Error::Config(format!("Unknown search mode: {}", s))),
        }
    }
}

/// A ranked search result with its component scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    pub record: ResourceRecord,
    pub score: f64,
    pub lexical_score: Option<f64>,
    pub vector_score: Option<f64>,
}

/// Total order used for every result list
pub fn compare_ranked(a: &RankedResult, b: &RankedResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.record.popularity.cmp(&a.record.popularity))
        .then_with(|| a.record.id.cmp(&b.record.id))
        .then_with(|| a.record.resource_type.cmp(&b.record.resource_type))
}

fn min_max(scores: &[f64]) -> Option<(f64, f64)> {
    let mut iter = scores.iter().copied().filter(|s| s.is_finite());
    let first = iter.next()?;
    Some(iter.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s))))
}

/// Normalize scores to [0, 1]; a single distinct value maps to 1.0
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let Some((lo, hi)) = min_max(scores) else {
        return vec![0.0; scores.len()];
    };
    let span = hi - lo;
    scores
        .iter()
        .map(|s| {
            if !s.is_finite() {
                0.0
            } else if span <= f64::EPSILON {
                1.0
            } else {
                (s - lo) / span
            }
        })
        .collect()
}

/// Fuses lexical and vector candidates
#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    lexical_weight: f64,
    vector_weight: f64,
}

impl Ranker {
    /// `lexical_weight` is clamped to [0, 1]; the vector side gets the rest
    pub fn new(lexical_weight: f64) -> Self {
        let lexical_weight = lexical_weight.clamp(0.0, 1.0);
        Self {
            lexical_weight,
            vector_weight: 1.0 - lexical_weight,
        }
    }

    /// Rank lexical hits alone
    pub fn rank_lexical(&self, hits: Vec<(ResourceRecord, f64)>) -> Vec<RankedResult> {
        let mut ranked: Vec<RankedResult> = hits
            .into_iter()
            .map(|(record, score)| RankedResult {
                record,
                score,
                lexical_score: Some(score),
                vector_score: None,
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Rank vector hits alone
    pub fn rank_vector(&self, hits: Vec<(ResourceRecord, f64)>) -> Vec<RankedResult> {
        let mut ranked: Vec<RankedResult> = hits
            .into_iter()
            .map(|(record, score)| RankedResult {
                record,
                score,
                lexical_score: None,
                vector_score: Some(score),
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Weighted sum of normalized scores; a record missing from one list scores 0 there
    pub fn rank_hybrid(
        &self,
        lexical: Vec<(ResourceRecord, f64)>,
        vector: Vec<(ResourceRecord, f64)>,
    ) -> Vec<RankedResult> {
        let lexical_norm = normalize_scores(&lexical.iter().map(|(_, s)| *s).collect::<Vec<_>>());
        let vector_norm = normalize_scores(&vector.iter().map(|(_, s)| *s).collect::<Vec<_>>());

        let mut merged: HashMap<ResourceKey, RankedResult> = HashMap::new();
        for ((record, raw), norm) in lexical.into_iter().zip(lexical_norm) {
            merged.insert(
                record.key(),
                RankedResult {
                    record,
                    score: self.lexical_weight * norm,
                    lexical_score: Some(raw),
                    vector_score: None,
                },
            );
        }
        for ((record, raw), norm) in vector.into_iter().zip(vector_norm) {
            let contribution = self.vector_weight * norm;
            match merged.get_mut(&record.key()) {
                Some(existing) => {
                    existing.score += contribution;
                    existing.vector_score = Some(raw);
                }
                None => {
                    merged.insert(
                        record.key(),
                        RankedResult {
                            record,
                            score: contribution,
                            lexical_score: None,
                            vector_score: Some(raw),
                        },
                    );
                }
            }
        }

        let mut ranked: Vec<RankedResult> = merged.into_values().collect();
        ranked.sort_by(compare_ranked);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Popularity, ResourceType};

    fn record(id: &str, downloads: u64) -> ResourceRecord {
        let mut r = ResourceRecord::new(ResourceType::Model, id);
        r.popularity = Popularity { downloads, likes: 0 };
        r
    }

    fn ids(results: &[RankedResult]) -> Vec<&str> {
        results.iter().map(|r| r.record.id.as_str()).collect()
    }

    #[test]
    fn test_normalize_scores() {
        assert_eq!(normalize_scores(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize_scores(&[5.0]), vec![1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_hybrid_combines_both_lists() {
        let ranker = Ranker::new(0.5);
        let lexical = vec![(record("a/lex", 0), 10.0), (record("a/both", 0), 5.0)];
        let vector = vec![(record("a/both", 0), 0.9), (record("a/vec", 0), 0.1)];

        let ranked = ranker.rank_hybrid(lexical, vector);
        assert_eq!(ids(&ranked), vec!["a/both", "a/lex", "a/vec"]);
        assert!((ranked[0].score - 0.5).abs() < 1e-9);
        assert_eq!(ranked[0].lexical_score, Some(5.0));
        assert_eq!(ranked[0].vector_score, Some(0.9));
    }

    #[test]
    fn test_ties_break_by_popularity_then_id() {
        let ranker = Ranker::new(1.0);
        let lexical = vec![
            (record("b/tie", 10), 1.0),
            (record("a/tie", 10), 1.0),
            (record("c/popular", 99), 1.0),
        ];
        let ranked = ranker.rank_hybrid(lexical, Vec::new());
        assert_eq!(ids(&ranked), vec!["c/popular", "a/tie", "b/tie"]);
    }

    #[test]
    fn test_hybrid_is_deterministic() {
        let ranker = Ranker::new(0.3);
        let lexical: Vec<_> = (0..20)
            .map(|i| (record(&format!("org/m{}", i), i % 3), (i % 4) as f64))
            .collect();
        let vector: Vec<_> = (10..30)
            .map(|i| (record(&format!("org/m{}", i), i % 3), (i % 5) as f64 / 5.0))
            .collect();

        let first = ranker.rank_hybrid(lexical.clone(), vector.clone());
        for _ in 0..5 {
            let again = ranker.rank_hybrid(lexical.clone(), vector.clone());
            assert_eq!(ids(&first), ids(&again));
        }
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("semantic".parse::<SearchMode>().unwrap(), SearchMode::Semantic);
        assert_eq!("Hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
