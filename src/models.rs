//! Core data models used throughout cpm.
//!
//! These types represent the chunks, manifests, and trust metadata that flow
//! through the build and query pipelines. The data lifecycle is:
//!
//! ```text
//! Source tree → chunker → Chunk → embed → vector rows
//!                                    ↓
//!               PacketManifest + cpm-lock.json (written last, atomically)
//!                                    ↓
//!        resolve() → PacketReference → fetch() → LocalPacket (+ TrustReport)
//! ```
//!
//! # Invariants
//!
//! - Vector row *i* corresponds to the *i*-th line of `docs.jsonl`.
//! - `Chunk::hash` is SHA-256 of the normalized chunk text
//!   (NFC, LF line endings, trailing whitespace stripped per line).
//! - A packet's identity is the SHA-256 of its `manifest.json` bytes; any
//!   rebuild that changes content produces a new digest.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Normalize chunk text before hashing: NFC, LF line endings, and trailing
/// whitespace stripped from every line and from the end of the text.
pub fn normalize_chunk_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let joined: Vec<&str> = nfc
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).trim_end())
        .collect();
    joined.join("\n").trim_end().to_string()
}

/// SHA-256 of the normalized chunk text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_chunk_text(text).as_bytes()))
}

/// SHA-256 of arbitrary bytes, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Per-chunk metadata persisted in `docs.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source-relative path with forward slashes.
    pub path: String,
    /// Lowercased file extension including the dot (e.g. `".rs"`).
    pub ext: String,
    /// Symbol path for AST chunkers (e.g. `"Router.dispatch"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// A chunk of source text, one line of `docs.jsonl`.
///
/// `id` is `"<source_path>:<chunk_index>"`, or
/// `"<source_path>:<symbol_path>:<ord>"` for AST chunkers, and is unique
/// within a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    /// SHA-256 of the normalized text; stable across runs.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(id: String, text: String, metadata: ChunkMetadata) -> Self {
        let hash = content_hash(&text);
        Self {
            id,
            text,
            hash,
            metadata,
        }
    }
}

/// Embedding parameters recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    pub model: String,
    pub dim: usize,
    pub dtype: String,
    pub normalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seq_length: Option<usize>,
}

/// Document and vector counts; `vectors == docs` in a complete packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCounts {
    pub docs: usize,
    pub vectors: usize,
}

/// Incremental build accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalStats {
    pub enabled: bool,
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
}

/// Checksum of an artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: String,
    pub value: String,
}

impl Checksum {
    pub fn sha256(value: String) -> Self {
        Self {
            algo: "sha256".to_string(),
            value,
        }
    }
}

/// Packaging metadata embedded in the manifest and mirrored in `cpm.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entrypoints: Vec<String>,
    #[serde(default)]
    pub builder: String,
}

/// Where the packet came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub input_dir: String,
    #[serde(default)]
    pub file_ext_counts: BTreeMap<String, usize>,
}

/// Immutable packet metadata, written once per build.
///
/// The manifest digest (SHA-256 of `manifest.json` bytes) defines the
/// packet's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketManifest {
    pub schema_version: String,
    /// Packet name.
    pub packet_id: String,
    /// Semver version string.
    pub version: String,
    /// UTC ISO-8601 creation timestamp.
    pub created_at: String,
    pub embedding: EmbeddingSpec,
    pub counts: PacketCounts,
    pub incremental: IncrementalStats,
    /// Artifact filename → checksum.
    pub checksums: BTreeMap<String, Checksum>,
    pub cpm: PacketMeta,
    pub source: SourceInfo,
}

impl PacketManifest {
    pub const SCHEMA_VERSION: &'static str = "1.0";

    /// Canonical JSON bytes (what is written to disk and what the digest is
    /// computed over). Struct field order is fixed and maps are BTreeMaps,
    /// so the output is canonical.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec_pretty(self).expect("manifest serializes");
        bytes.push(b'\n');
        bytes
    }

    /// `sha256:<hex>` digest of the canonical manifest bytes.
    pub fn digest(&self) -> String {
        format!("sha256:{}", sha256_hex(&self.canonical_bytes()))
    }
}

/// Verification of one trust component (signature, SBOM, or provenance).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustCheck {
    pub present: bool,
    pub valid: bool,
    /// Signature issuer, SBOM format, or SLSA level, depending on component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregated trust verification result for a packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustReport {
    pub signature: TrustCheck,
    pub sbom: TrustCheck,
    pub provenance: TrustCheck,
    /// Weighted score in `[0.0, 1.0]`.
    pub score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Logical handle returned by `Source::resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketReference {
    pub uri: String,
    /// `sha256:<hex>` identity digest.
    pub digest: String,
    /// Alternative or related references (mirrors, referrer names).
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustReport>,
}

/// A packet materialized on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalPacket {
    pub path: PathBuf,
    pub manifest: PacketManifest,
    pub lock: Option<crate::lockfile::Lockfile>,
    pub trust: Option<TrustReport>,
}

/// Result of `Source::check_updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub latest_digest: String,
    pub current_digest: String,
    pub newer: bool,
    #[serde(default)]
    pub refs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_trailing_whitespace() {
        assert_eq!(normalize_chunk_text("foo  \nbar\t\n"), "foo\nbar");
    }

    #[test]
    fn test_normalize_crlf() {
        assert_eq!(normalize_chunk_text("a\r\nb\r\n"), "a\nb");
    }

    #[test]
    fn test_normalize_nfc() {
        // U+0065 U+0301 (e + combining acute) normalizes to U+00E9.
        assert_eq!(normalize_chunk_text("caf\u{0065}\u{0301}"), "caf\u{00e9}");
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash("def f():\n    pass   ");
        let b = content_hash("def f():\n    pass");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_chunk_new_hashes() {
        let chunk = Chunk::new(
            "a.md:0".into(),
            "# Heading\nbody".into(),
            ChunkMetadata {
                path: "a.md".into(),
                ext: ".md".into(),
                symbol: None,
            },
        );
        assert_eq!(chunk.hash, content_hash("# Heading\nbody"));
    }

    #[test]
    fn test_manifest_digest_changes_with_content() {
        let mut manifest = PacketManifest {
            schema_version: PacketManifest::SCHEMA_VERSION.into(),
            packet_id: "demo".into(),
            version: "1.0.0".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            embedding: EmbeddingSpec {
                model: "m".into(),
                dim: 4,
                dtype: "float16".into(),
                normalized: true,
                max_seq_length: Some(1024),
            },
            counts: PacketCounts {
                docs: 2,
                vectors: 2,
            },
            incremental: IncrementalStats::default(),
            checksums: BTreeMap::new(),
            cpm: PacketMeta::default(),
            source: SourceInfo::default(),
        };
        let first = manifest.digest();
        assert_eq!(first, manifest.digest());
        manifest.counts.docs = 3;
        assert_ne!(first, manifest.digest());
    }

    #[test]
    fn test_chunk_roundtrip_json() {
        let chunk = Chunk::new(
            "src/lib.rs:parse:0".into(),
            "fn parse() {}".into(),
            ChunkMetadata {
                path: "src/lib.rs".into(),
                ext: ".rs".into(),
                symbol: Some("parse".into()),
            },
        );
        let line = serde_json::to_string(&chunk).unwrap();
        let back: Chunk = serde_json::from_str(&line).unwrap();
        assert_eq!(chunk, back);
    }
}
