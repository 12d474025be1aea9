//! Package store operations: install, uninstall, list, update.
//!
//! `install <source-uri>` resolves, verifies, and policy-gates a source,
//! then materializes the packet under `packages/<name>/<version>/` with its
//! lockfile extended by a `source` block (uri, digest, verification,
//! resolved_at) and a lock snapshot for time-travel.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::cas::SourceCache;
use crate::error::{CpmError, Result};
use crate::lockfile::{Lockfile, PipelineLock, SourceLock, LOCK_SCHEMA_VERSION};
use crate::models::UpdateInfo;
use crate::packet::{self, LOCK_FILE, MANIFEST_FILE};
use crate::policy::{decision_error, evaluate_with_hub, Decision, OperationKind, PolicyContext};
use crate::source::SourceResolver;
use crate::workspace::Context;

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub digest: String,
    pub trust_score: Option<f64>,
    pub warnings: Vec<String>,
}

/// Resolve, verify, policy-gate, and materialize a source URI.
pub async fn install(ctx: &Context, uri: &str) -> Result<InstallReport> {
    let mut warnings = Vec::new();

    let pre = evaluate_with_hub(
        &ctx.policy,
        ctx.config.hub.as_ref(),
        &ctx.http,
        OperationKind::Install,
        &PolicyContext {
            source_uri: Some(uri.to_string()),
            ..PolicyContext::default()
        },
    )
    .await;
    if pre.is_deny() {
        return Err(decision_error(&pre));
    }

    let resolver = SourceResolver::from_context(ctx);
    let reference = resolver.resolve(uri).await?;

    let gate = evaluate_with_hub(
        &ctx.policy,
        ctx.config.hub.as_ref(),
        &ctx.http,
        OperationKind::Install,
        &PolicyContext {
            source_uri: Some(uri.to_string()),
            trust: reference.trust.clone(),
            ..PolicyContext::default()
        },
    )
    .await;
    if gate.is_deny() {
        return Err(decision_error(&gate));
    }
    if gate.decision == Decision::Warn {
        warnings.extend(gate.reasons.iter().cloned());
    }

    let cache = SourceCache::new(
        ctx.workspace.objects_dir(),
        ctx.config.cache.objects_quota_bytes,
    );
    let packet = resolver.fetch(&reference, &cache).await?;

    let name = packet.manifest.cpm.name.clone();
    let version = packet.manifest.cpm.version.clone();
    if name.is_empty() || version.is_empty() {
        return Err(CpmError::Fetch {
            uri: uri.to_string(),
            reason: "packet manifest is missing name or version".to_string(),
        });
    }

    let target = ctx.workspace.package_dir(&name, &version);
    copy_packet(&packet.path, &target)?;

    // Extend the lockfile with install provenance, then snapshot it.
    let lock_path = target.join(LOCK_FILE);
    let mut lock = Lockfile::load(&lock_path).unwrap_or_else(|_| Lockfile {
        schema_version: LOCK_SCHEMA_VERSION,
        inputs: Default::default(),
        pipeline: PipelineLock {
            chunker_config: ctx.config.chunking.clone(),
            embed_model: packet.manifest.embedding.model.clone(),
            retrieval_caps: ctx.config.retrieval.clone(),
        },
        outputs: Default::default(),
        source: None,
        parent_snapshot: None,
    });
    lock.source = Some(SourceLock {
        uri: uri.to_string(),
        digest: reference.digest.clone(),
        verification: packet.trust.clone().unwrap_or_default(),
        resolved_at: ctx.clock.now_iso(),
    });
    lock.save(&lock_path)
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    lock.snapshot(&ctx.workspace, &name, &ctx.clock.now_stamp())
        .map_err(|e| CpmError::Cache(e.to_string()))?;

    info!(name, version, digest = %reference.digest, "installed");
    Ok(InstallReport {
        name,
        version,
        path: target,
        digest: reference.digest,
        trust_score: packet.trust.as_ref().map(|t| t.score),
        warnings,
    })
}

fn copy_packet(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| CpmError::Cache(e.to_string()))?;
        let target = to.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledPacket {
    pub name: String,
    pub version: String,
    pub digest: String,
    pub source_uri: Option<String>,
}

/// Enumerate the local package store.
pub fn list_installed(ctx: &Context) -> Result<Vec<InstalledPacket>> {
    let mut installed = Vec::new();
    let base = ctx.workspace.packages_dir();
    let Ok(names) = std::fs::read_dir(&base) else {
        return Ok(installed);
    };
    for name_entry in names.flatten() {
        let Ok(versions) = std::fs::read_dir(name_entry.path()) else {
            continue;
        };
        for version_entry in versions.flatten() {
            let dir = version_entry.path();
            if !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let digest = packet::packet_digest(&dir).unwrap_or_default();
            let source_uri = Lockfile::load(&dir.join(LOCK_FILE))
                .ok()
                .and_then(|lock| lock.source.map(|s| s.uri));
            installed.push(InstalledPacket {
                name: name_entry.file_name().to_string_lossy().into_owned(),
                version: version_entry.file_name().to_string_lossy().into_owned(),
                digest,
                source_uri,
            });
        }
    }
    installed.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
    Ok(installed)
}

/// Remove an installed version (or all versions when `version` is None).
pub fn uninstall(ctx: &Context, name: &str, version: Option<&str>) -> Result<usize> {
    let base = ctx.workspace.packages_dir().join(name);
    let target = match version {
        Some(version) => base.join(version),
        None => base.clone(),
    };
    if !target.exists() {
        return Err(CpmError::Usage(format!(
            "'{}' is not installed",
            match version {
                Some(v) => format!("{}@{}", name, v),
                None => name.to_string(),
            }
        )));
    }
    let removed = walkdir::WalkDir::new(&target)
        .into_iter()
        .flatten()
        .filter(|e| e.path().join(MANIFEST_FILE).is_file())
        .count()
        .max(1);
    std::fs::remove_dir_all(&target)?;
    // Drop the now-empty name directory.
    if version.is_some() && base.read_dir().map(|mut d| d.next().is_none()).unwrap_or(false) {
        let _ = std::fs::remove_dir(&base);
    }
    Ok(removed)
}

/// Check every installed packet with a recorded source for updates.
pub async fn check_updates(ctx: &Context) -> Result<Vec<(InstalledPacket, UpdateInfo)>> {
    let resolver = SourceResolver::from_context(ctx);
    let mut reports = Vec::new();
    for packet in list_installed(ctx)? {
        let Some(uri) = packet.source_uri.clone() else {
            continue;
        };
        let reference = crate::models::PacketReference {
            uri,
            digest: packet.digest.clone(),
            refs: Vec::new(),
            trust: None,
        };
        match resolver.check_updates(&reference).await {
            Ok(update) => reports.push((packet, update)),
            Err(err) => {
                tracing::warn!(name = %packet.name, %err, "update check failed");
            }
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::Policy;
    use crate::workspace::Workspace;

    fn ctx(root: &Path) -> Context {
        Context::new(Workspace::new(root), Config::default(), Policy::default())
    }

    fn write_minimal_packet(dir: &Path, name: &str, version: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let manifest = serde_json::json!({
            "schema_version": "1.0",
            "packet_id": name,
            "version": version,
            "created_at": "2026-01-01T00:00:00Z",
            "embedding": {"model": "m", "dim": 4, "dtype": "float16", "normalized": true},
            "counts": {"docs": 0, "vectors": 0},
            "incremental": {"enabled": false, "reused": 0, "embedded": 0, "removed": 0},
            "checksums": {},
            "cpm": {"name": name, "version": version, "description": "", "tags": [], "entrypoints": [], "builder": ""},
            "source": {"input_dir": "", "file_ext_counts": {}},
        });
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_install_from_dir_source() {
        let tmp = tempfile::tempdir().unwrap();
        let packet_dir = tmp.path().join("built");
        write_minimal_packet(&packet_dir, "demo", "1.0.0");
        let ctx = ctx(tmp.path());

        let uri = format!("dir://{}", packet_dir.display());
        let report = install(&ctx, &uri).await.unwrap();
        assert_eq!(report.name, "demo");
        assert_eq!(report.version, "1.0.0");
        assert!(report.path.join(MANIFEST_FILE).is_file());

        let lock = Lockfile::load(&report.path.join(LOCK_FILE)).unwrap();
        let source = lock.source.unwrap();
        assert_eq!(source.uri, uri);
        assert_eq!(source.digest, report.digest);

        let installed = list_installed(&ctx).unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].name, "demo");
    }

    #[tokio::test]
    async fn test_uninstall() {
        let tmp = tempfile::tempdir().unwrap();
        let packet_dir = tmp.path().join("built");
        write_minimal_packet(&packet_dir, "demo", "1.0.0");
        let ctx = ctx(tmp.path());
        install(&ctx, &format!("dir://{}", packet_dir.display()))
            .await
            .unwrap();

        uninstall(&ctx, "demo", Some("1.0.0")).unwrap();
        assert!(list_installed(&ctx).unwrap().is_empty());
        assert!(uninstall(&ctx, "demo", Some("1.0.0")).is_err());
    }

    #[tokio::test]
    async fn test_install_policy_deny() {
        let tmp = tempfile::tempdir().unwrap();
        let packet_dir = tmp.path().join("built");
        write_minimal_packet(&packet_dir, "demo", "1.0.0");
        let mut ctx = ctx(tmp.path());
        ctx.policy.allowed_sources = vec!["oci://trusted.example/*".to_string()];

        let err = install(&ctx, &format!("dir://{}", packet_dir.display()))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
