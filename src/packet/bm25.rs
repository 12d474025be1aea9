//! Okapi BM25 sparse index (`bm25.bin`).
//!
//! Standard BM25 with `k1 = 1.2`, `b = 0.75` and
//! `idf(t) = ln(1 + (N - df + 0.5) / (df + 0.5))`. Tokenization is the
//! shared tokenizer, identical to chunk cutting. The on-disk form is JSON so
//! a missing or stale artifact can always be rebuilt from `docs.jsonl`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::tokenizer::tokenize;

use super::atomic_write;

const K1: f32 = 1.2;
const B: f32 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    pub doc_count: usize,
    pub avgdl: f32,
    pub doc_len: Vec<u32>,
    /// term → [(doc row, term frequency)]
    pub postings: BTreeMap<String, Vec<(u32, u32)>>,
}

impl Bm25Index {
    /// Build from chunk texts, in row order.
    pub fn build<'a, I>(texts: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut doc_len: Vec<u32> = Vec::new();
        let mut postings: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();

        for (row, text) in texts.into_iter().enumerate() {
            let terms = tokenize(text);
            doc_len.push(terms.len() as u32);
            let mut counts: HashMap<String, u32> = HashMap::new();
            for term in terms {
                *counts.entry(term).or_insert(0) += 1;
            }
            let mut counts: Vec<(String, u32)> = counts.into_iter().collect();
            counts.sort();
            for (term, tf) in counts {
                postings.entry(term).or_default().push((row as u32, tf));
            }
        }

        let doc_count = doc_len.len();
        let avgdl = if doc_count == 0 {
            1.0
        } else {
            doc_len.iter().sum::<u32>() as f32 / doc_count as f32
        };
        Self {
            doc_count,
            avgdl: avgdl.max(1e-6),
            doc_len,
            postings,
        }
    }

    /// Top-`k` rows by BM25 score for the query terms. Rows with zero score
    /// are omitted; ties break by ascending row index.
    pub fn search(&self, query_terms: &[String], k: usize) -> Vec<(usize, f32)> {
        if self.doc_count == 0 || query_terms.is_empty() {
            return Vec::new();
        }
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for term in query_terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f32;
            let n = self.doc_count as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for &(row, tf) in postings {
                let length = self.doc_len[row as usize] as f32;
                let tf = tf as f32;
                let denom = tf + K1 * (1.0 - B + B * (length / self.avgdl));
                *scores.entry(row).or_insert(0.0) += idf * (tf * (K1 + 1.0)) / denom.max(1e-6);
            }
        }
        let mut ranked: Vec<(usize, f32)> = scores
            .into_iter()
            .filter(|&(_, score)| score > 0.0)
            .map(|(row, score)| (row as usize, score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(k.max(1));
        ranked
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse bm25 index {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Bm25Index {
        Bm25Index::build(["alpha beta", "beta gamma", "gamma delta"])
    }

    #[test]
    fn test_exact_term_ranks_first() {
        let hits = index().search(&["beta".to_string()], 3);
        assert_eq!(hits.len(), 2);
        // "alpha beta" and "beta gamma" both contain the term once with
        // equal length; tie breaks by row.
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn test_zero_score_rows_omitted() {
        let hits = index().search(&["delta".to_string()], 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn test_unknown_term_empty() {
        assert!(index().search(&["omega".to_string()], 3).is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25.bin");
        let original = index();
        original.save(&path).unwrap();
        let loaded = Bm25Index::load(&path).unwrap();
        assert_eq!(
            original.search(&["gamma".to_string()], 3),
            loaded.search(&["gamma".to_string()], 3)
        );
    }

    #[test]
    fn test_repeated_term_scores_higher() {
        let index = Bm25Index::build(["cache cache cache", "cache miss penalty"]);
        let hits = index.search(&["cache".to_string()], 2);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1 > hits[1].1);
    }
}
