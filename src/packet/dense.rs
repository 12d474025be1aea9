//! Flat inner-product similarity index (`faiss/index.faiss`).
//!
//! Binary format (little-endian):
//!
//! ```text
//! Magic: "CPFI" (4 bytes)
//! Version: u16
//! Dim: u32
//! Count: u32
//! Rows: Count × Dim × f32, row-major
//! ```
//!
//! Search is an exact scan: no training, `add` only. Results are sorted by
//! descending score; ties break by ascending row index so ranking is
//! byte-identical across runs.

use std::path::Path;

use anyhow::Result;

use crate::error::CpmError;

use super::atomic_write;

const MAGIC: [u8; 4] = *b"CPFI";
const VERSION: u16 = 1;

/// Exact inner-product index over f32 rows.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append rows. Every row must match the index dimension.
    pub fn add(&mut self, rows: &[Vec<f32>]) -> Result<(), CpmError> {
        for row in rows {
            if row.len() != self.dim {
                return Err(CpmError::Index(format!(
                    "row width {} does not match index dim {}",
                    row.len(),
                    self.dim
                )));
            }
            self.data.extend_from_slice(row);
        }
        Ok(())
    }

    /// Top-`k` rows by inner product with `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, CpmError> {
        if query.len() != self.dim {
            return Err(CpmError::Index(format!(
                "query width {} does not match index dim {}",
                query.len(),
                self.dim
            )));
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, values)| (row, super::vectors::dot(values, query)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k.max(1));
        Ok(scored)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::with_capacity(14 + self.data.len() * 4);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        atomic_write(path, &bytes)
    }

    pub fn load(path: &Path) -> Result<Self, CpmError> {
        let bytes = std::fs::read(path).map_err(|e| {
            CpmError::Index(format!("failed to read index {}: {}", path.display(), e))
        })?;
        if bytes.len() < 14 || bytes[..4] != MAGIC {
            return Err(CpmError::Index(format!(
                "{} is not a CPFI index",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(CpmError::Index(format!(
                "unsupported index version {}",
                version
            )));
        }
        let dim = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let count = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize;
        let expected = 14 + count * dim * 4;
        if bytes.len() != expected || dim == 0 {
            return Err(CpmError::Index(format!(
                "index {} is truncated or corrupt",
                path.display()
            )));
        }
        let data: Vec<f32> = bytes[14..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { dim, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FlatIpIndex {
        let mut index = FlatIpIndex::new(3);
        index
            .add(&[
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.7, 0.7, 0.0],
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_search_ranks_by_dot_product() {
        let hits = index().search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 2);
        assert_eq!(hits[2].0, 1);
    }

    #[test]
    fn test_ties_break_by_row() {
        let mut index = FlatIpIndex::new(2);
        index
            .add(&[vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]])
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.faiss");
        let original = index();
        original.save(&path).unwrap();
        let loaded = FlatIpIndex::load(&path).unwrap();
        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.len(), 3);
        assert_eq!(
            original.search(&[0.5, 0.5, 0.0], 3).unwrap(),
            loaded.search(&[0.5, 0.5, 0.0], 3).unwrap()
        );
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let mut index = FlatIpIndex::new(3);
        assert!(index.add(&[vec![1.0, 0.0]]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.faiss");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(FlatIpIndex::load(&path).is_err());
    }
}
