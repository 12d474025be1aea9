//! Pluggable rerankers, operating on the over-fetched candidate list.

use crate::error::{CpmError, Result};

use super::retriever::Hit;

/// A reranker takes the top-k' candidates and returns the final top-k.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    fn rerank(&self, hits: Vec<Hit>, vectors: &[Vec<f32>], k: usize) -> Vec<Hit>;
}

pub fn create_reranker(name: &str) -> Result<Box<dyn Reranker>> {
    match name {
        "none" => Ok(Box::new(NoopReranker)),
        "token-diversity" => Ok(Box::new(TokenDiversityReranker)),
        other => Err(CpmError::Usage(format!(
            "unknown reranker: '{}' (none, token-diversity)",
            other
        ))),
    }
}

/// Identity: keep the retrieval order, cut to k.
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn name(&self) -> &str {
        "none"
    }

    fn rerank(&self, mut hits: Vec<Hit>, _vectors: &[Vec<f32>], k: usize) -> Vec<Hit> {
        hits.truncate(k.max(1));
        hits
    }
}

/// Maximal marginal relevance over chunk vectors, λ = 0.5.
///
/// Iteratively selects the candidate maximizing
/// `λ·relevance − (1−λ)·max_similarity(selected)`, trading relevance for
/// diversity. Relevance is the retrieval score min-max normalized over the
/// candidate set.
pub struct TokenDiversityReranker;

const LAMBDA: f32 = 0.5;

impl Reranker for TokenDiversityReranker {
    fn name(&self) -> &str {
        "token-diversity"
    }

    fn rerank(&self, hits: Vec<Hit>, vectors: &[Vec<f32>], k: usize) -> Vec<Hit> {
        let k = k.max(1);
        if hits.len() <= 1 {
            return hits;
        }

        let scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
        let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let range = (max - min).max(1e-9);
        let relevance: Vec<f32> = scores.iter().map(|s| (s - min) / range).collect();

        let mut remaining: Vec<usize> = (0..hits.len()).collect();
        let mut selected: Vec<usize> = Vec::with_capacity(k);

        while selected.len() < k && !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (pos, &candidate) in remaining.iter().enumerate() {
                let max_sim = selected
                    .iter()
                    .map(|&chosen| {
                        similarity(vectors, hits[candidate].row, hits[chosen].row)
                    })
                    .fold(0.0f32, f32::max);
                let value = LAMBDA * relevance[candidate] - (1.0 - LAMBDA) * max_sim;
                if value > best_value {
                    best_value = value;
                    best_pos = pos;
                }
            }
            selected.push(remaining.remove(best_pos));
        }

        let mut by_index: Vec<(usize, Hit)> = hits.into_iter().enumerate().collect();
        by_index.retain(|(idx, _)| selected.contains(idx));
        // Preserve MMR selection order.
        by_index.sort_by_key(|(idx, _)| selected.iter().position(|s| s == idx).unwrap_or(0));
        by_index.into_iter().map(|(_, hit)| hit).collect()
    }
}

fn similarity(vectors: &[Vec<f32>], a: usize, b: usize) -> f32 {
    match (vectors.get(a), vectors.get(b)) {
        (Some(va), Some(vb)) => crate::packet::vectors::cosine_similarity(va, vb),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(row: usize, id: &str, score: f32) -> Hit {
        Hit {
            row,
            id: id.into(),
            path: id.into(),
            symbol: None,
            score,
            dense_score: Some(score),
            text: format!("text {}", id),
        }
    }

    #[test]
    fn test_noop_truncates() {
        let hits = vec![hit(0, "a", 0.9), hit(1, "b", 0.8), hit(2, "c", 0.7)];
        let out = NoopReranker.rerank(hits, &[], 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
    }

    #[test]
    fn test_mmr_prefers_diverse_over_duplicate() {
        // Rows 0 and 1 are near-identical vectors; row 2 is orthogonal.
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.999, 0.04],
            vec![0.0, 1.0],
        ];
        let hits = vec![hit(0, "a", 1.0), hit(1, "a-dup", 0.98), hit(2, "b", 0.5)];
        let out = TokenDiversityReranker.rerank(hits, &vectors, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
        // The near-duplicate is penalized; the orthogonal hit wins slot 2.
        assert_eq!(out[1].id, "b");
    }

    #[test]
    fn test_mmr_deterministic() {
        let vectors = vec![vec![1.0, 0.0], vec![0.5, 0.5], vec![0.0, 1.0]];
        let hits = vec![hit(0, "a", 0.9), hit(1, "b", 0.8), hit(2, "c", 0.7)];
        let one = TokenDiversityReranker.rerank(hits.clone(), &vectors, 3);
        let two = TokenDiversityReranker.rerank(hits, &vectors, 3);
        let ids1: Vec<&str> = one.iter().map(|h| h.id.as_str()).collect();
        let ids2: Vec<&str> = two.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn test_create_reranker() {
        assert!(create_reranker("none").is_ok());
        assert!(create_reranker("token-diversity").is_ok());
        assert!(create_reranker("cross-encoder").is_err());
    }
}
