//! Lockfile: inputs → pipeline → outputs binding, plus timestamped
//! snapshots for time-travel.
//!
//! A lockfile is valid iff every recorded output checksum equals the current
//! SHA-256 of that artifact on disk. Lock snapshots live under
//! `state/locks/<packet>/<stamp>.json`; `--as-of` resolves to the largest
//! snapshot whose stamp is `<=` the requested time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ChunkingConfig, RetrievalConfig};
use crate::error::CpmError;
use crate::models::TrustReport;
use crate::workspace::Workspace;

pub const LOCK_SCHEMA_VERSION: u32 = 1;

/// Pipeline parameters pinned by the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLock {
    pub chunker_config: ChunkingConfig,
    pub embed_model: String,
    pub retrieval_caps: RetrievalConfig,
}

/// Provenance of a remotely fetched source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLock {
    pub uri: String,
    pub digest: String,
    pub verification: TrustReport,
    pub resolved_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    pub schema_version: u32,
    /// Source-relative input file → sha256.
    pub inputs: BTreeMap<String, String>,
    pub pipeline: PipelineLock,
    /// Artifact file → sha256.
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLock>,
    /// Stamp of the snapshot this build descended from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot: Option<String>,
}

impl Lockfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lockfile {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        crate::packet::atomic_write(path, &bytes)
    }

    /// Check every output checksum against the artifact on disk.
    pub fn verify(&self, packet_dir: &Path) -> std::result::Result<(), CpmError> {
        for (artifact, expected) in &self.outputs {
            let path = packet_dir.join(artifact);
            let actual = crate::packet::sha256_file(&path).map_err(|_| CpmError::LockMismatch {
                artifact: artifact.clone(),
                expected: expected.clone(),
                actual: "<missing>".to_string(),
            })?;
            if &actual != expected {
                return Err(CpmError::LockMismatch {
                    artifact: artifact.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Copy this lockfile into the snapshot history. Returns the stamp.
    pub fn snapshot(&self, workspace: &Workspace, packet: &str, stamp: &str) -> Result<String> {
        let dir = workspace.locks_dir(packet);
        std::fs::create_dir_all(&dir)?;
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        crate::packet::atomic_write(&dir.join(format!("{}.json", stamp)), &bytes)?;
        Ok(stamp.to_string())
    }
}

/// A snapshot on disk: its stamp, parse time, and path.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub stamp: String,
    pub at: DateTime<Utc>,
    pub path: PathBuf,
}

/// List a packet's snapshots, oldest first.
pub fn list_snapshots(workspace: &Workspace, packet: &str) -> Vec<Snapshot> {
    let dir = workspace.locks_dir(packet);
    let mut snapshots = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return snapshots;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name.strip_suffix(".json") else {
            continue;
        };
        let Some(at) = parse_stamp(stamp) else {
            continue;
        };
        snapshots.push(Snapshot {
            stamp: stamp.to_string(),
            at,
            path: entry.path(),
        });
    }
    snapshots.sort_by_key(|s| s.at);
    snapshots
}

/// Largest snapshot with `at <= as_of`.
pub fn resolve_as_of(
    workspace: &Workspace,
    packet: &str,
    as_of: DateTime<Utc>,
) -> Option<Snapshot> {
    list_snapshots(workspace, packet)
        .into_iter()
        .filter(|s| s.at <= as_of)
        .next_back()
}

/// Parse a snapshot stamp (`20260301T123045.250Z`).
pub fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let trimmed = stamp.strip_suffix('Z')?;
    let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S"))
        .ok()?;
    Some(parsed.and_utc())
}

/// Parse a user-supplied `--as-of` value: RFC 3339, `YYYY-MM-DDTHH:MM:SS`,
/// `YYYY-MM-DD`, or a raw snapshot stamp.
pub fn parse_as_of(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(at.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_hms_opt(23, 59, 59)?.and_utc());
    }
    parse_stamp(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockfile() -> Lockfile {
        Lockfile {
            schema_version: LOCK_SCHEMA_VERSION,
            inputs: BTreeMap::new(),
            pipeline: PipelineLock {
                chunker_config: ChunkingConfig::default(),
                embed_model: "m".into(),
                retrieval_caps: RetrievalConfig::default(),
            },
            outputs: BTreeMap::new(),
            source: None,
            parent_snapshot: None,
        }
    }

    #[test]
    fn test_verify_detects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("docs.jsonl");
        std::fs::write(&artifact, b"original").unwrap();
        let mut lock = lockfile();
        lock.outputs.insert(
            "docs.jsonl".into(),
            crate::packet::sha256_file(&artifact).unwrap(),
        );
        assert!(lock.verify(dir.path()).is_ok());

        std::fs::write(&artifact, b"tampered").unwrap();
        let err = lock.verify(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_verify_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = lockfile();
        lock.outputs.insert("gone.bin".into(), "0".repeat(64));
        assert!(lock.verify(dir.path()).is_err());
    }

    #[test]
    fn test_stamp_roundtrip() {
        let at = parse_stamp("20260301T123045.250Z").unwrap();
        assert_eq!(at.format("%Y%m%dT%H%M%S%.3fZ").to_string(), "20260301T123045.250Z");
    }

    #[test]
    fn test_as_of_resolution_picks_largest_below() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let lock = lockfile();
        lock.snapshot(&ws, "pkt", "20260101T000000.000Z").unwrap();
        lock.snapshot(&ws, "pkt", "20260201T000000.000Z").unwrap();
        lock.snapshot(&ws, "pkt", "20260301T000000.000Z").unwrap();

        let as_of = parse_as_of("2026-02-15").unwrap();
        let snapshot = resolve_as_of(&ws, "pkt", as_of).unwrap();
        assert_eq!(snapshot.stamp, "20260201T000000.000Z");

        let early = parse_as_of("2025-12-01").unwrap();
        assert!(resolve_as_of(&ws, "pkt", early).is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpm-lock.json");
        let mut lock = lockfile();
        lock.inputs.insert("a.md".into(), "1".repeat(64));
        lock.parent_snapshot = Some("20260101T000000.000Z".into());
        lock.save(&path).unwrap();
        assert_eq!(Lockfile::load(&path).unwrap(), lock);
    }
}
