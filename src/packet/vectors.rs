//! Float16 vector storage and similarity math.
//!
//! Vectors are stored as `N×dim` float16, row-major, little-endian
//! (`vectors.f16.bin`). All similarity math runs in f32; f16 is purely the
//! at-rest representation, which halves packet size at a precision cost that
//! is irrelevant for cosine ranking.

use std::path::Path;

use anyhow::{Context as _, Result};
use half::f16;

use super::atomic_write;

/// Serialize rows as little-endian f16 and write atomically.
pub fn write_vectors_f16(rows: &[Vec<f32>], path: &Path) -> Result<()> {
    let mut bytes = Vec::with_capacity(rows.iter().map(Vec::len).sum::<usize>() * 2);
    for row in rows {
        for &value in row {
            bytes.extend_from_slice(&f16::from_f32(value).to_le_bytes());
        }
    }
    atomic_write(path, &bytes)
}

/// Read an `N×dim` f16 matrix back into f32 rows.
///
/// Fails if the file size is not a whole number of `dim`-wide rows.
pub fn read_vectors_f16(path: &Path, dim: usize) -> Result<Vec<Vec<f32>>> {
    anyhow::ensure!(dim > 0, "vector dim must be > 0");
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    anyhow::ensure!(
        bytes.len() % (dim * 2) == 0,
        "vector file {} is not a whole number of {}-dim f16 rows",
        path.display(),
        dim
    );
    let mut rows = Vec::with_capacity(bytes.len() / (dim * 2));
    for row_bytes in bytes.chunks_exact(dim * 2) {
        let row: Vec<f32> = row_bytes
            .chunks_exact(2)
            .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Dot product; rows are normalized at embed time so this is cosine.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1.0, 1.0]`; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// L2-normalize in place; zero vectors are left unchanged.
pub fn normalize(row: &mut [f32]) {
    let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in row.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.f16.bin");
        let rows = vec![vec![1.0f32, -0.5, 0.25, 0.0], vec![0.125, 2.0, -1.0, 0.5]];
        write_vectors_f16(&rows, &path).unwrap();
        let back = read_vectors_f16(&path, 4).unwrap();
        assert_eq!(rows, back); // all values are exactly representable in f16
    }

    #[test]
    fn test_read_rejects_ragged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.f16.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(read_vectors_f16(&path, 4).is_err());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut row = vec![3.0, 4.0];
        normalize(&mut row);
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        let mut row = vec![0.0, 0.0];
        normalize(&mut row);
        assert_eq!(row, vec![0.0, 0.0]);
    }
}
