//! Indexers: dense flat inner-product, sparse BM25, and hybrid RRF fusion.
//!
//! The retriever over-fetches `k' = max(k·4, 50)` candidates so the
//! reranker has room to work, then the reranker cuts to `k`. Hybrid fusion
//! is reciprocal-rank: `score(d) = Σ 1/(60 + rank_i(d))`, ties broken by
//! descending dense score then ascending chunk id.
//!
//! Missing artifacts never fail silently: a lost dense index is rebuilt
//! from `vectors.f16.bin`, a lost sparse index falls back to a runtime
//! build (hybrid) or to the dense index (bm25), and every fallback records
//! a warning.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::error::{CpmError, Result};
use crate::models::Chunk;
use crate::packet::bm25::Bm25Index;
use crate::packet::dense::FlatIpIndex;
use crate::packet::{vectors, BM25_FILE, INDEX_FILE, VECTORS_FILE};
use crate::tokenizer::tokenize;

const RRF_C: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerKind {
    FlatIp,
    Bm25,
    HybridRrf,
}

impl IndexerKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "faiss-flatip" => Ok(Self::FlatIp),
            "bm25" => Ok(Self::Bm25),
            "hybrid-rrf" => Ok(Self::HybridRrf),
            other => Err(CpmError::Usage(format!(
                "unknown indexer: '{}' (faiss-flatip, bm25, hybrid-rrf)",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlatIp => "faiss-flatip",
            Self::Bm25 => "bm25",
            Self::HybridRrf => "hybrid-rrf",
        }
    }
}

/// One retrieved chunk with its ranking score.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub row: usize,
    pub id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub score: f32,
    /// Dense score, kept for hybrid tie-breaking and MMR relevance.
    #[serde(skip)]
    pub dense_score: Option<f32>,
    pub text: String,
}

pub struct RetrievalOutcome {
    pub hits: Vec<Hit>,
    pub warnings: Vec<String>,
}

/// Over-fetch width for the rerank stage.
pub fn candidate_k(k: usize) -> usize {
    (k * 4).max(50)
}

/// Run retrieval over a packet directory.
pub fn retrieve(
    packet_dir: &Path,
    chunks: &[Chunk],
    dim: usize,
    query_vec: &[f32],
    query: &str,
    kind: IndexerKind,
    k: usize,
) -> Result<RetrievalOutcome> {
    let mut warnings = Vec::new();
    let k_prime = candidate_k(k);
    let query_terms = tokenize(query);

    let hits = match kind {
        IndexerKind::FlatIp => {
            let index = load_dense(packet_dir, dim, &mut warnings)?;
            dense_hits(&index, chunks, query_vec, k_prime)?
        }
        IndexerKind::Bm25 => match load_sparse(packet_dir) {
            Some(sparse) => sparse_hits(&sparse, chunks, &query_terms, k_prime),
            None => {
                warnings.push("sparse_index_missing_fallback_flatip".to_string());
                let index = load_dense(packet_dir, dim, &mut warnings)?;
                dense_hits(&index, chunks, query_vec, k_prime)?
            }
        },
        IndexerKind::HybridRrf => {
            let index = load_dense(packet_dir, dim, &mut warnings)?;
            let dense = dense_hits(&index, chunks, query_vec, k_prime)?;
            let sparse_index = match load_sparse(packet_dir) {
                Some(sparse) => sparse,
                None => {
                    warnings.push("sparse_index_missing_fallback_runtime".to_string());
                    Bm25Index::build(chunks.iter().map(|c| c.text.as_str()))
                }
            };
            let sparse = sparse_hits(&sparse_index, chunks, &query_terms, k_prime);
            fuse_rrf(dense, sparse)
        }
    };

    Ok(RetrievalOutcome { hits, warnings })
}

fn load_dense(packet_dir: &Path, dim: usize, warnings: &mut Vec<String>) -> Result<FlatIpIndex> {
    match FlatIpIndex::load(&packet_dir.join(INDEX_FILE)) {
        Ok(index) => Ok(index),
        Err(load_err) => {
            // Rebuild from the vector artifact rather than failing the query.
            let rows = vectors::read_vectors_f16(&packet_dir.join(VECTORS_FILE), dim)
                .map_err(|_| load_err)?;
            let mut index = FlatIpIndex::new(dim);
            index.add(&rows)?;
            warnings.push("dense_index_rebuilt_from_vectors".to_string());
            Ok(index)
        }
    }
}

fn load_sparse(packet_dir: &Path) -> Option<Bm25Index> {
    Bm25Index::load(&packet_dir.join(BM25_FILE)).ok()
}

fn make_hit(chunks: &[Chunk], row: usize, score: f32, dense_score: Option<f32>) -> Option<Hit> {
    let chunk = chunks.get(row)?;
    Some(Hit {
        row,
        id: chunk.id.clone(),
        path: chunk.metadata.path.clone(),
        symbol: chunk.metadata.symbol.clone(),
        score,
        dense_score,
        text: chunk.text.clone(),
    })
}

fn dense_hits(
    index: &FlatIpIndex,
    chunks: &[Chunk],
    query_vec: &[f32],
    k: usize,
) -> Result<Vec<Hit>> {
    let scored = index.search(query_vec, k)?;
    Ok(scored
        .into_iter()
        .filter_map(|(row, score)| make_hit(chunks, row, score, Some(score)))
        .collect())
}

fn sparse_hits(index: &Bm25Index, chunks: &[Chunk], terms: &[String], k: usize) -> Vec<Hit> {
    index
        .search(terms, k)
        .into_iter()
        .filter_map(|(row, score)| make_hit(chunks, row, score, None))
        .collect()
}

/// Reciprocal-rank fusion of the dense and sparse candidate lists.
fn fuse_rrf(dense: Vec<Hit>, sparse: Vec<Hit>) -> Vec<Hit> {
    let mut fused: HashMap<usize, Hit> = HashMap::new();

    for (rank, hit) in dense.into_iter().enumerate() {
        let rrf = 1.0 / (RRF_C + (rank + 1) as f32);
        let entry = fused.entry(hit.row).or_insert(Hit { score: 0.0, ..hit });
        entry.score += rrf;
    }
    for (rank, hit) in sparse.into_iter().enumerate() {
        let rrf = 1.0 / (RRF_C + (rank + 1) as f32);
        let entry = fused.entry(hit.row).or_insert(Hit { score: 0.0, ..hit });
        entry.score += rrf;
    }

    let mut ranked: Vec<Hit> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let da = a.dense_score.unwrap_or(f32::NEG_INFINITY);
                let db = b.dense_score.unwrap_or(f32::NEG_INFINITY);
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use crate::packet::vectors::normalize;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk::new(
            id.into(),
            text.into(),
            ChunkMetadata {
                path: id.split(':').next().unwrap_or(id).into(),
                ext: ".txt".into(),
                symbol: None,
            },
        )
    }

    fn write_packet(dir: &Path, rows: &[Vec<f32>], chunks: &[Chunk], with_sparse: bool) {
        let mut index = FlatIpIndex::new(rows[0].len());
        index.add(&rows.to_vec()).unwrap();
        index.save(&dir.join(INDEX_FILE)).unwrap();
        vectors::write_vectors_f16(rows, &dir.join(VECTORS_FILE)).unwrap();
        if with_sparse {
            Bm25Index::build(chunks.iter().map(|c| c.text.as_str()))
                .save(&dir.join(BM25_FILE))
                .unwrap();
        }
    }

    #[test]
    fn test_candidate_k_floor() {
        assert_eq!(candidate_k(3), 50);
        assert_eq!(candidate_k(20), 80);
    }

    #[test]
    fn test_dense_retrieval() {
        let tmp = tempfile::tempdir().unwrap();
        let chunks = vec![chunk("a.txt:0", "alpha"), chunk("b.txt:0", "beta")];
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        write_packet(tmp.path(), &rows, &chunks, false);

        let outcome = retrieve(
            tmp.path(),
            &chunks,
            2,
            &[0.9, 0.1],
            "alpha",
            IndexerKind::FlatIp,
            2,
        )
        .unwrap();
        assert_eq!(outcome.hits[0].id, "a.txt:0");
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_hybrid_rrf_ordering_matches_hand_computation() {
        // Dense ranks chunk2 first (2,1,3); BM25 ranks chunk1 first
        // (1,2,3 after the tie rule). RRF totals: chunk1 = 1/62+1/61,
        // chunk2 = 1/61+1/62, chunk3 = 1/63+1/63. chunk1 and chunk2 tie,
        // so the dense score decides in chunk2's favor.
        let tmp = tempfile::tempdir().unwrap();
        let chunks = vec![
            chunk("c1.txt:0", "alpha beta"),
            chunk("c2.txt:0", "beta gamma"),
            chunk("c3.txt:0", "gamma delta"),
        ];
        let mut q = vec![0.6, 0.8, 0.0];
        normalize(&mut q);
        let rows = vec![
            vec![0.0, 1.0, 0.0], // c1: dense rank 2
            vec![0.6, 0.8, 0.0], // c2: dense rank 1
            vec![0.0, 0.0, 1.0], // c3: dense rank 3
        ];
        write_packet(tmp.path(), &rows, &chunks, true);

        let outcome = retrieve(
            tmp.path(),
            &chunks,
            3,
            &q,
            "beta",
            IndexerKind::HybridRrf,
            3,
        )
        .unwrap();
        let ids: Vec<&str> = outcome.hits.iter().map(|h| h.id.as_str()).collect();
        // Fused scores are equal for c1 and c2; the dense tie-break puts c2
        // (higher dense score) first, c3 last.
        assert_eq!(ids, vec!["c2.txt:0", "c1.txt:0", "c3.txt:0"]);
        assert!(outcome.hits[0].score > outcome.hits[2].score);
    }

    #[test]
    fn test_missing_sparse_falls_back_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let chunks = vec![chunk("a.txt:0", "alpha"), chunk("b.txt:0", "beta")];
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        write_packet(tmp.path(), &rows, &chunks, false);

        let outcome = retrieve(
            tmp.path(),
            &chunks,
            2,
            &[1.0, 0.0],
            "beta",
            IndexerKind::HybridRrf,
            2,
        )
        .unwrap();
        assert!(outcome
            .warnings
            .contains(&"sparse_index_missing_fallback_runtime".to_string()));
        assert!(!outcome.hits.is_empty());
    }

    #[test]
    fn test_missing_dense_rebuilt_from_vectors() {
        let tmp = tempfile::tempdir().unwrap();
        let chunks = vec![chunk("a.txt:0", "alpha"), chunk("b.txt:0", "beta")];
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        write_packet(tmp.path(), &rows, &chunks, false);
        std::fs::remove_file(tmp.path().join(INDEX_FILE)).unwrap();

        let outcome = retrieve(
            tmp.path(),
            &chunks,
            2,
            &[1.0, 0.0],
            "alpha",
            IndexerKind::FlatIp,
            2,
        )
        .unwrap();
        assert!(outcome
            .warnings
            .contains(&"dense_index_rebuilt_from_vectors".to_string()));
        assert_eq!(outcome.hits[0].id, "a.txt:0");
    }
}
