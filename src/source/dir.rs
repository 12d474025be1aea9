//! Local directory source (`dir://path` or a plain path).

use std::path::PathBuf;

use async_trait::async_trait;

use crate::cas::SourceCache;
use crate::error::{CpmError, Result};
use crate::models::{LocalPacket, PacketReference, UpdateInfo};
use crate::packet;

pub struct DirSource;

fn dir_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("dir://").unwrap_or(uri))
}

impl DirSource {
    fn digest_of(uri: &str) -> Result<String> {
        let path = dir_path(uri);
        let manifest = path.join(packet::MANIFEST_FILE);
        if !manifest.is_file() {
            return Err(CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: format!("no {} under {}", packet::MANIFEST_FILE, path.display()),
            });
        }
        packet::packet_digest(&path).map_err(|e| CpmError::SourceResolve {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl super::Source for DirSource {
    fn name(&self) -> &str {
        "dir"
    }

    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("dir://") || dir_path(uri).is_dir()
    }

    async fn resolve(&self, uri: &str) -> Result<PacketReference> {
        Ok(PacketReference {
            uri: uri.to_string(),
            digest: Self::digest_of(uri)?,
            refs: Vec::new(),
            trust: None,
        })
    }

    async fn fetch(
        &self,
        reference: &PacketReference,
        _cache: &SourceCache,
    ) -> Result<LocalPacket> {
        // Local directories are already materialized; no CAS copy.
        let path = dir_path(&reference.uri);
        LocalPacket::load(&path).map_err(|e| CpmError::Fetch {
            uri: reference.uri.clone(),
            reason: e.to_string(),
        })
    }

    async fn check_updates(&self, reference: &PacketReference) -> Result<UpdateInfo> {
        let latest = Self::digest_of(&reference.uri)?;
        Ok(UpdateInfo {
            newer: latest != reference.digest,
            latest_digest: latest,
            current_digest: reference.digest.clone(),
            refs: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::Source as _;
    use super::*;

    fn write_packet(dir: &std::path::Path) {
        std::fs::create_dir_all(dir).unwrap();
        let manifest = serde_json::json!({
            "schema_version": "1.0",
            "packet_id": "demo",
            "version": "1.0.0",
            "created_at": "2026-01-01T00:00:00Z",
            "embedding": {"model": "m", "dim": 4, "dtype": "float16", "normalized": true},
            "counts": {"docs": 0, "vectors": 0},
            "incremental": {"enabled": false, "reused": 0, "embedded": 0, "removed": 0},
            "checksums": {},
            "cpm": {"name": "demo", "version": "1.0.0", "description": "", "tags": [], "entrypoints": [], "builder": ""},
            "source": {"input_dir": "", "file_ext_counts": {}},
        });
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_and_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let packet_dir = tmp.path().join("pkt");
        write_packet(&packet_dir);
        let uri = format!("dir://{}", packet_dir.display());

        let source = DirSource;
        assert!(source.can_handle(&uri));
        let reference = source.resolve(&uri).await.unwrap();
        assert!(reference.digest.starts_with("sha256:"));

        let cache = SourceCache::new(tmp.path().join("cas"), u64::MAX);
        let packet = source.fetch(&reference, &cache).await.unwrap();
        assert_eq!(packet.manifest.packet_id, "demo");
    }

    #[tokio::test]
    async fn test_update_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let packet_dir = tmp.path().join("pkt");
        write_packet(&packet_dir);
        let uri = format!("dir://{}", packet_dir.display());
        let source = DirSource;
        let reference = source.resolve(&uri).await.unwrap();

        let same = source.check_updates(&reference).await.unwrap();
        assert!(!same.newer);

        // Mutate the manifest; the digest moves.
        let path = packet_dir.join("manifest.json");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text = text.replace("1.0.0", "1.1.0");
        std::fs::write(&path, text).unwrap();
        let changed = source.check_updates(&reference).await.unwrap();
        assert!(changed.newer);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_resolve_error() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        let uri = format!("dir://{}", empty.display());
        assert!(DirSource.resolve(&uri).await.is_err());
    }
}
