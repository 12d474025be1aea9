//! Packet artifact layout and I/O.
//!
//! On disk a packet is:
//!
//! ```text
//! <packet>/
//!   cpm.yml             # human-readable twin of the manifest
//!   manifest.json       # immutable metadata; its digest is the identity
//!   docs.jsonl          # one JSON chunk per line: {id, text, hash, metadata}
//!   vectors.f16.bin     # N×dim float16, row-major, little-endian
//!   faiss/index.faiss   # flat inner-product index
//!   bm25.bin            # optional sparse index
//!   cpm-lock.json       # inputs → pipeline → outputs binding
//! ```
//!
//! All artifact writes are atomic: write to a temp file in the same
//! directory, then rename. A failed build deletes its temp files and leaves
//! any previous artifacts untouched.

pub mod bm25;
pub mod dense;
pub mod vectors;

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{Checksum, Chunk, LocalPacket, PacketManifest};

pub const DOCS_FILE: &str = "docs.jsonl";
pub const VECTORS_FILE: &str = "vectors.f16.bin";
pub const INDEX_FILE: &str = "faiss/index.faiss";
pub const BM25_FILE: &str = "bm25.bin";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CPM_YML_FILE: &str = "cpm.yml";
pub const LOCK_FILE: &str = "cpm-lock.json";

/// Write bytes atomically: temp file in the target directory, then rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(".tmp-{}", file_name));
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn write_docs_jsonl(chunks: &[Chunk], path: &Path) -> Result<()> {
    let mut out = Vec::new();
    for chunk in chunks {
        serde_json::to_writer(&mut out, chunk)?;
        out.push(b'\n');
    }
    atomic_write(path, &out)
}

pub fn read_docs_jsonl(path: &Path) -> Result<Vec<Chunk>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut chunks = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid chunk record", path.display(), lineno + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

pub fn write_manifest(manifest: &PacketManifest, path: &Path) -> Result<()> {
    atomic_write(path, &manifest.canonical_bytes())
}

pub fn load_manifest(path: &Path) -> Result<PacketManifest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", path.display()))
}

/// `sha256:<hex>` identity digest of a packet directory (the manifest file).
pub fn packet_digest(packet_dir: &Path) -> Result<String> {
    Ok(format!(
        "sha256:{}",
        sha256_file(&packet_dir.join(MANIFEST_FILE))?
    ))
}

#[derive(Debug, Serialize)]
struct CpmYml<'a> {
    cpm_schema: u32,
    name: &'a str,
    version: &'a str,
    description: &'a str,
    tags: &'a [String],
    entrypoints: &'a [String],
    embedding_model: &'a str,
    embedding_dim: usize,
    embedding_normalized: bool,
    created_at: &'a str,
}

/// Write the human-readable `cpm.yml` twin of the manifest.
pub fn write_cpm_yml(manifest: &PacketManifest, path: &Path) -> Result<()> {
    let doc = CpmYml {
        cpm_schema: 1,
        name: &manifest.cpm.name,
        version: &manifest.cpm.version,
        description: &manifest.cpm.description,
        tags: &manifest.cpm.tags,
        entrypoints: &manifest.cpm.entrypoints,
        embedding_model: &manifest.embedding.model,
        embedding_dim: manifest.embedding.dim,
        embedding_normalized: manifest.embedding.normalized,
        created_at: &manifest.created_at,
    };
    let yaml = serde_yaml::to_string(&doc)?;
    atomic_write(path, yaml.as_bytes())
}

/// SHA-256 checksums of artifact files relative to the packet root.
pub fn compute_checksums(root: &Path, files: &[&str]) -> Result<BTreeMap<String, Checksum>> {
    let mut checksums = BTreeMap::new();
    for file in files {
        let path = root.join(file);
        if !path.exists() {
            continue;
        }
        checksums.insert(file.to_string(), Checksum::sha256(sha256_file(&path)?));
    }
    Ok(checksums)
}

impl LocalPacket {
    /// Load a packet directory: manifest is required, lock is optional.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let manifest = load_manifest(&path.join(MANIFEST_FILE))?;
        let lock = crate::lockfile::Lockfile::load(&path.join(LOCK_FILE)).ok();
        Ok(Self {
            path,
            manifest,
            lock,
            trust: None,
        })
    }
}

/// Infer packaging tags from the extension histogram of the scanned source.
pub fn infer_tags(ext_counts: &BTreeMap<String, usize>) -> Vec<String> {
    let has = |ext: &str| ext_counts.get(ext).copied().unwrap_or(0) > 0;
    let mut tags: Vec<&str> = Vec::new();
    if has(".py") {
        tags.push("python");
    }
    if has(".js") || has(".jsx") || has(".mjs") || has(".cjs") {
        tags.push("javascript");
    }
    if has(".ts") || has(".tsx") {
        tags.push("typescript");
    }
    if has(".java") {
        tags.push("java");
    }
    if has(".kt") {
        tags.push("kotlin");
    }
    if has(".go") {
        tags.push("go");
    }
    if has(".rs") {
        tags.push("rust");
    }
    if has(".c") || has(".h") || has(".cpp") || has(".cc") || has(".cxx") || has(".hpp") || has(".hh") {
        tags.push("cpp");
    }
    if has(".cs") {
        tags.push("csharp");
    }
    if has(".md") || has(".markdown") || has(".rst") || has(".txt") {
        tags.push("docs");
    }
    tags.push("cpm");
    let mut tags: Vec<String> = tags.into_iter().map(str::to_string).collect();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn sample_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new(
                "a.md:0".into(),
                "# H\nfoo bar".into(),
                ChunkMetadata {
                    path: "a.md".into(),
                    ext: ".md".into(),
                    symbol: None,
                },
            ),
            Chunk::new(
                "b.py:f:0".into(),
                "def f(): pass".into(),
                ChunkMetadata {
                    path: "b.py".into(),
                    ext: ".py".into(),
                    symbol: Some("f".into()),
                },
            ),
        ]
    }

    #[test]
    fn test_docs_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCS_FILE);
        let chunks = sample_chunks();
        write_docs_jsonl(&chunks, &path).unwrap();
        let back = read_docs_jsonl(&path).unwrap();
        assert_eq!(chunks, back);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        atomic_write(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["file.bin".to_string()]);
    }

    #[test]
    fn test_checksums_skip_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present"), b"x").unwrap();
        let sums = compute_checksums(dir.path(), &["present", "absent"]).unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums["present"].algo, "sha256");
    }

    #[test]
    fn test_infer_tags() {
        let mut counts = BTreeMap::new();
        counts.insert(".py".to_string(), 3);
        counts.insert(".md".to_string(), 1);
        let tags = infer_tags(&counts);
        assert!(tags.contains(&"python".to_string()));
        assert!(tags.contains(&"docs".to_string()));
        assert!(tags.contains(&"cpm".to_string()));
    }
}
