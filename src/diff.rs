//! Packet diff and drift scoring.
//!
//! Chunks are paired by id across two packets and classified as `added`,
//! `removed`, or `changed` (content hash differs). Each changed pair gets
//! the cosine distance between its vectors; the aggregate **drift score** is
//! the mean distance over changed pairs, reported overall and per section
//! (path prefix).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Serialize;

use crate::error::{CpmError, Result};
use crate::packet::{self, vectors, DOCS_FILE, MANIFEST_FILE, VECTORS_FILE};

#[derive(Debug, Clone, Serialize)]
pub struct ChangedChunk {
    pub id: String,
    pub cosine_distance: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionDrift {
    pub changed: usize,
    pub added: usize,
    pub removed: usize,
    pub drift: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedChunk>,
    pub unchanged: usize,
    /// Mean cosine distance over changed pairs (0.0 when nothing changed).
    pub drift_score: f32,
    pub sections: BTreeMap<String, SectionDrift>,
}

impl DiffReport {
    pub fn exceeds(&self, max_drift: f32) -> bool {
        self.drift_score > max_drift
    }
}

/// Compare two packet directories.
pub fn diff_packets(a_dir: &Path, b_dir: &Path) -> Result<DiffReport> {
    let a = load_side(a_dir)?;
    let b = load_side(b_dir)?;

    let a_by_id: HashMap<&str, usize> = a
        .chunks
        .iter()
        .enumerate()
        .map(|(row, chunk)| (chunk.id.as_str(), row))
        .collect();
    let b_by_id: HashMap<&str, usize> = b
        .chunks
        .iter()
        .enumerate()
        .map(|(row, chunk)| (chunk.id.as_str(), row))
        .collect();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    let mut unchanged = 0usize;
    let mut sections: BTreeMap<String, SectionDrift> = BTreeMap::new();
    let mut section_distance: BTreeMap<String, f32> = BTreeMap::new();

    for chunk in &a.chunks {
        if !b_by_id.contains_key(chunk.id.as_str()) {
            removed.push(chunk.id.clone());
            sections
                .entry(section_of(&chunk.metadata.path))
                .or_default()
                .removed += 1;
        }
    }
    for (b_row, chunk) in b.chunks.iter().enumerate() {
        let section = section_of(&chunk.metadata.path);
        match a_by_id.get(chunk.id.as_str()) {
            None => {
                added.push(chunk.id.clone());
                sections.entry(section).or_default().added += 1;
            }
            Some(&a_row) => {
                if a.chunks[a_row].hash == chunk.hash {
                    unchanged += 1;
                    continue;
                }
                let distance = cosine_distance(&a.vectors[a_row], &b.vectors[b_row]);
                changed.push(ChangedChunk {
                    id: chunk.id.clone(),
                    cosine_distance: distance,
                });
                let entry = sections.entry(section.clone()).or_default();
                entry.changed += 1;
                *section_distance.entry(section).or_insert(0.0) += distance;
            }
        }
    }

    for (section, entry) in sections.iter_mut() {
        if entry.changed > 0 {
            entry.drift =
                section_distance.get(section).copied().unwrap_or(0.0) / entry.changed as f32;
        }
    }
    let drift_score = if changed.is_empty() {
        0.0
    } else {
        changed.iter().map(|c| c.cosine_distance).sum::<f32>() / changed.len() as f32
    };

    Ok(DiffReport {
        added,
        removed,
        changed,
        unchanged,
        drift_score,
        sections,
    })
}

struct Side {
    chunks: Vec<crate::models::Chunk>,
    vectors: Vec<Vec<f32>>,
}

fn load_side(dir: &Path) -> Result<Side> {
    let manifest = packet::load_manifest(&dir.join(MANIFEST_FILE))
        .map_err(|e| CpmError::Index(format!("{}: {}", dir.display(), e)))?;
    let chunks = packet::read_docs_jsonl(&dir.join(DOCS_FILE))
        .map_err(|e| CpmError::Index(format!("{}: {}", dir.display(), e)))?;
    let vectors = vectors::read_vectors_f16(&dir.join(VECTORS_FILE), manifest.embedding.dim)
        .map_err(|e| CpmError::Index(format!("{}: {}", dir.display(), e)))?;
    if vectors.len() != chunks.len() {
        return Err(CpmError::Index(format!(
            "{}: {} chunks but {} vector rows",
            dir.display(),
            chunks.len(),
            vectors.len()
        )));
    }
    Ok(Side { chunks, vectors })
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - vectors::cosine_similarity(a, b)).clamp(0.0, 2.0)
}

fn section_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}
