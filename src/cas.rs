//! Content-addressed source cache.
//!
//! Objects live under `cache/objects/<2-hex-prefix>/<rest-of-hex>` keyed by
//! their `sha256:<hex>` digest. Entries are immutable once written:
//!
//! - `put` is idempotent and atomic (write temp → fsync → rename) and
//!   verifies the bytes against the digest before committing.
//! - `get`/`read` verify the digest on the way out; a corrupt entry is
//!   reported, never silently returned.
//! - Eviction is strict LRU over access times with a byte quota. An entry
//!   whose advisory lock is held by an active fetch is never evicted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::{CpmError, Result};

const TMP_DIR: &str = ".tmp";
const LOCKS_DIR: &str = ".locks";

/// Guard holding a digest's advisory lock for the duration of a fetch.
/// While alive, eviction skips the entry.
pub struct FetchGuard {
    _file: fs::File,
    path: PathBuf,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct SourceCache {
    root: PathBuf,
    quota_bytes: u64,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
        }
    }

    fn hex_of(digest: &str) -> Result<&str> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CpmError::Cache(format!("malformed digest '{}'", digest)));
        }
        Ok(hex)
    }

    pub fn object_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = Self::hex_of(digest)?;
        Ok(self.root.join(&hex[..2]).join(&hex[2..]))
    }

    fn lock_path(&self, hex: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", hex))
    }

    /// Hold a shared advisory lock on a digest while a fetch is using it.
    pub fn pin(&self, digest: &str) -> Result<FetchGuard> {
        let hex = Self::hex_of(digest)?;
        let path = self.lock_path(hex);
        fs::create_dir_all(path.parent().expect("lock path has parent"))?;
        let file = fs::File::create(&path)?;
        file.lock_shared()
            .map_err(|e| CpmError::Cache(format!("failed to lock {}: {}", digest, e)))?;
        Ok(FetchGuard { _file: file, path })
    }

    /// Store bytes under their digest. Idempotent: an existing entry is
    /// verified and kept.
    pub fn put(&self, digest: &str, bytes: &[u8]) -> Result<PathBuf> {
        let hex = Self::hex_of(digest)?;
        let actual = hex::encode(Sha256::digest(bytes));
        if actual != hex {
            return Err(CpmError::Cache(format!(
                "digest mismatch on put: expected {}, got sha256:{}",
                digest, actual
            )));
        }

        let object = self.object_path(digest)?;
        if object.exists() {
            return Ok(object);
        }
        fs::create_dir_all(object.parent().expect("object path has parent"))?;
        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        let tmp = tmp_dir.join(format!("{}.partial", hex));

        let result: Result<()> = (|| {
            let mut file = fs::File::create(&tmp)?;
            std::io::Write::write_all(&mut file, bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &object)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map(|_| object)
    }

    /// Path to an entry, or None when absent.
    pub fn get(&self, digest: &str) -> Result<Option<PathBuf>> {
        let object = self.object_path(digest)?;
        Ok(object.exists().then_some(object))
    }

    /// Read and digest-verify an entry.
    pub fn read(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.get(digest)? else {
            return Ok(None);
        };
        let bytes = fs::read(&path)?;
        let hex = Self::hex_of(digest)?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != hex {
            return Err(CpmError::Cache(format!(
                "object {} is corrupt (sha256:{})",
                digest, actual
            )));
        }
        Ok(Some(bytes))
    }

    /// Entry count and total bytes.
    pub fn stats(&self) -> (usize, u64) {
        let mut count = 0usize;
        let mut bytes = 0u64;
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file() && !in_internal_dir(entry.path(), &self.root) {
                count += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        (count, bytes)
    }

    /// Remove `.partial` leftovers from interrupted writes.
    pub fn sweep_partials(&self) -> Result<usize> {
        let tmp_dir = self.root.join(TMP_DIR);
        let mut removed = 0;
        if let Ok(entries) = fs::read_dir(&tmp_dir) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".partial")
                {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// LRU-evict entries until the byte quota holds. Entries pinned by an
    /// active fetch are skipped. Returns (entries removed, bytes freed).
    pub fn evict_to_quota(&self) -> Result<(usize, u64)> {
        let (_, total) = self.stats();
        if total <= self.quota_bytes {
            return Ok((0, 0));
        }

        let mut entries: Vec<(PathBuf, String, SystemTime, u64)> = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_file() || in_internal_dir(entry.path(), &self.root) {
                continue;
            }
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            let used = meta.accessed().or_else(|_| meta.modified())?;
            let hex = format!(
                "{}{}",
                entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                entry.file_name().to_string_lossy()
            );
            entries.push((entry.path().to_path_buf(), hex, used, meta.len()));
        }
        entries.sort_by_key(|(_, _, used, _)| *used);

        let mut remaining = total;
        let mut removed = 0usize;
        let mut freed = 0u64;
        for (path, hex, _, size) in entries {
            if remaining <= self.quota_bytes {
                break;
            }
            // An exclusive try-lock fails while a fetch holds the shared
            // lock; skip those entries.
            let lock_path = self.lock_path(&hex);
            if let Ok(lock) = fs::File::create(&lock_path) {
                if lock.try_lock_exclusive().is_err() {
                    tracing::debug!(digest = %hex, "skipping eviction of pinned object");
                    continue;
                }
                let _ = fs2::FileExt::unlock(&lock);
            }
            if fs::remove_file(&path).is_ok() {
                remaining = remaining.saturating_sub(size);
                freed += size;
                removed += 1;
            }
            let _ = fs::remove_file(&lock_path);
        }
        tracing::debug!(removed, freed, "cas eviction complete");
        Ok((removed, freed))
    }

    /// Re-verify a sample of entries; returns digests that failed.
    pub fn verify_sample(&self, limit: usize) -> Result<Vec<String>> {
        let mut failures = Vec::new();
        let mut checked = 0usize;
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            if checked >= limit {
                break;
            }
            if !entry.file_type().is_file() || in_internal_dir(entry.path(), &self.root) {
                continue;
            }
            let prefix = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let digest = format!("sha256:{}{}", prefix, entry.file_name().to_string_lossy());
            checked += 1;
            if let Err(err) = self.read(&digest) {
                failures.push(format!("{}: {}", digest, err));
            }
        }
        Ok(failures)
    }
}

fn in_internal_dir(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| {
            let name = c.as_os_str().to_string_lossy();
            name == TMP_DIR || name == LOCKS_DIR
        })
        .unwrap_or(false)
}
