//! Workspace-level embedding cache.
//!
//! Persists individual vectors across packets under
//! `cache/embed/<model>/<2-hex>/<hash>.vec`, keyed by
//! `sha256(model || "\0" || normalized_chunk_text)`. Model names are opaque:
//! no cross-model reuse, even for aliases of the same underlying model.
//!
//! Vectors are stored as little-endian f16, the same representation the
//! packet uses at rest. Eviction is LRU over file access times with a byte
//! quota; writers take a per-key advisory lock so concurrent builders never
//! interleave within one entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context as _, Result};
use fs2::FileExt;
use half::f16;
use sha2::{Digest, Sha256};

use crate::models::normalize_chunk_text;

#[derive(Debug, Clone)]
pub struct EmbedCache {
    root: PathBuf,
    model: String,
    quota_bytes: u64,
}

impl EmbedCache {
    pub fn new(root: impl Into<PathBuf>, model: impl Into<String>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            model: model.into(),
            quota_bytes,
        }
    }

    /// Cache key for a chunk text under this cache's model.
    pub fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0]);
        hasher.update(normalize_chunk_text(text).as_bytes());
        hex::encode(hasher.finalize())
    }

    fn model_dir(&self) -> PathBuf {
        // Model names may contain '/'; flatten for the directory name.
        self.root.join(self.model.replace('/', "_"))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.model_dir().join(&key[..2]).join(format!("{}.vec", key))
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let path = self.entry_path(key);
        let bytes = fs::read(&path).ok()?;
        if bytes.len() % 2 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(2)
                .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
                .collect(),
        )
    }

    pub fn put(&self, key: &str, vector: &[f32]) -> Result<()> {
        let path = self.entry_path(key);
        let parent = path.parent().expect("entry path has parent");
        fs::create_dir_all(parent)?;

        let lock_path = parent.join(format!("{}.lock", key));
        let lock = fs::File::create(&lock_path)
            .with_context(|| format!("failed to create lock {}", lock_path.display()))?;
        lock.lock_exclusive()?;

        let mut bytes = Vec::with_capacity(vector.len() * 2);
        for &value in vector {
            bytes.extend_from_slice(&f16::from_f32(value).to_le_bytes());
        }
        let result = crate::packet::atomic_write(&path, &bytes);
        let _ = fs2::FileExt::unlock(&lock);
        let _ = fs::remove_file(&lock_path);
        result
    }

    /// Total bytes and entry count currently on disk for this model.
    pub fn stats(&self) -> (usize, u64) {
        let mut count = 0usize;
        let mut bytes = 0u64;
        for entry in walkdir::WalkDir::new(self.model_dir())
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == "vec")
            {
                count += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        (count, bytes)
    }

    /// Evict least-recently-used entries until the byte quota holds.
    /// Returns the number of entries removed.
    pub fn evict_to_quota(&self) -> Result<usize> {
        let (_, total) = self.stats();
        if total <= self.quota_bytes {
            return Ok(0);
        }
        let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in walkdir::WalkDir::new(self.model_dir())
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_file()
                || entry.path().extension().is_none_or(|e| e != "vec")
            {
                continue;
            }
            let meta = entry.metadata()?;
            let used = meta.accessed().or_else(|_| meta.modified())?;
            entries.push((entry.path().to_path_buf(), used, meta.len()));
        }
        entries.sort_by_key(|(_, used, _)| *used);

        let mut remaining = total;
        let mut removed = 0usize;
        for (path, _, size) in entries {
            if remaining <= self.quota_bytes {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                remaining = remaining.saturating_sub(size);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::new(dir.path(), "model-a", 1024 * 1024);
        let key = cache.key("some chunk text");
        cache.put(&key, &[0.5, -0.25, 1.0, 0.0]).unwrap();
        assert_eq!(cache.get(&key), Some(vec![0.5, -0.25, 1.0, 0.0]));
    }

    #[test]
    fn test_key_depends_on_model() {
        let dir = tempfile::tempdir().unwrap();
        let a = EmbedCache::new(dir.path(), "model-a", 0);
        let b = EmbedCache::new(dir.path(), "model-b", 0);
        assert_ne!(a.key("text"), b.key("text"));
    }

    #[test]
    fn test_key_normalizes_text() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::new(dir.path(), "m", 0);
        assert_eq!(cache.key("line one  \nline two"), cache.key("line one\nline two"));
    }

    #[test]
    fn test_miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::new(dir.path(), "m", 0);
        assert_eq!(cache.get(&cache.key("never stored")), None);
    }

    #[test]
    fn test_eviction_respects_quota() {
        let dir = tempfile::tempdir().unwrap();
        // 4-dim f16 entries are 8 bytes each; quota of 20 keeps two.
        let cache = EmbedCache::new(dir.path(), "m", 20);
        for i in 0..5 {
            let key = cache.key(&format!("text {}", i));
            cache.put(&key, &[i as f32, 0.0, 0.0, 0.0]).unwrap();
        }
        let removed = cache.evict_to_quota().unwrap();
        assert!(removed >= 3);
        let (_, bytes) = cache.stats();
        assert!(bytes <= 20);
    }
}
